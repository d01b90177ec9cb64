//! Serial document-processing stages driven through backend jobs.
//!
//! Each stage starts a backend job over the REST API, follows it with the
//! [`JobTracker`] and hands its result back before the next stage begins.
//! Progress from every tracked job is tagged with the [`JobStage`] that
//! started it; the tracker itself knows nothing about stages.

use std::sync::Arc;

use lumina_core::config::ClientConfig;
use lumina_core::types::{JobResponse, JobUpdate, SessionId};
use lumina_jobs::api::{ApiError, LuminaApi, QueryResponse, SchemaField};
use lumina_jobs::tracker::{JobTracker, TrackerError};
use serde::Serialize;

/// Intention sent to extraction when the caller gives none.
pub const DEFAULT_INTENTION: &str = "Extract structured data from the uploaded documents";

/// Which pipeline step started a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Analysis,
    Extraction,
    Indexing,
    DynamicExtraction,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Analysis => "analysis",
            JobStage::Extraction => "extraction",
            JobStage::Indexing => "indexing",
            JobStage::DynamicExtraction => "dynamic_extraction",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job update tagged with the stage that started the job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageUpdate {
    pub stage: JobStage,
    pub update: JobUpdate,
}

/// Results of the extraction and indexing jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionOutcome {
    pub extraction: Option<serde_json::Value>,
    pub indexing: Option<serde_json::Value>,
}

/// How a query was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Answered directly (retrieval or a synchronous tool call).
    Answer(QueryResponse),
    /// The query started a dynamic-extraction job, tracked to completion.
    /// `data` is the session's dataset re-fetched after the job finished.
    DynamicExtraction {
        response: QueryResponse,
        result: Option<serde_json::Value>,
        data: serde_json::Value,
    },
}

impl QueryOutcome {
    pub fn response(&self) -> &QueryResponse {
        match self {
            QueryOutcome::Answer(response) | QueryOutcome::DynamicExtraction { response, .. } => {
                response
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The backend refused the edited schema.
    #[error("Schema update rejected: {0}")]
    SchemaRejected(String),

    /// Graph generation needs at least one relevant record.
    #[error("Query returned no relevant records to build a graph from")]
    NoRelevantRecords,
}

type Progress = Arc<dyn Fn(StageUpdate) + Send + Sync>;

/// Runs pipeline stages against one backend.
#[derive(Clone)]
pub struct Pipeline {
    api: Arc<LuminaApi>,
    tracker: JobTracker,
}

impl Pipeline {
    pub fn new(api: Arc<LuminaApi>, tracker: JobTracker) -> Self {
        Self { api, tracker }
    }

    /// Build the API client and a tracker that polls through it.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let api = Arc::new(LuminaApi::from_config(config)?);
        let tracker = JobTracker::with_api(Arc::clone(&api), config);
        Ok(Self::new(api, tracker))
    }

    pub fn api(&self) -> &LuminaApi {
        &self.api
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Analyze the session's documents and return the analysis payload
    /// (document classifications and the recommended schema).
    pub async fn analyze<P>(
        &self,
        session_id: SessionId,
        progress: P,
    ) -> Result<Option<serde_json::Value>, PipelineError>
    where
        P: Fn(StageUpdate) + Send + Sync + 'static,
    {
        let progress: Progress = Arc::new(progress);
        let job = self.api.analyze_documents(session_id).await?;
        self.run_stage(JobStage::Analysis, job, &progress).await
    }

    /// Extract structured records, then index them for retrieval.
    ///
    /// When `schema` is given it is saved with the intention before
    /// extraction starts. Indexing only starts once extraction completed.
    /// An empty `intention` falls back to [`DEFAULT_INTENTION`].
    pub async fn extract_and_index<P>(
        &self,
        session_id: SessionId,
        intention: &str,
        schema: Option<&[SchemaField]>,
        progress: P,
    ) -> Result<ExtractionOutcome, PipelineError>
    where
        P: Fn(StageUpdate) + Send + Sync + 'static,
    {
        let progress: Progress = Arc::new(progress);
        let intention = match intention.trim() {
            "" => DEFAULT_INTENTION,
            given => given,
        };

        if let Some(fields) = schema {
            let saved = self.api.update_schema(session_id, intention, fields).await?;
            if !saved.success {
                return Err(PipelineError::SchemaRejected(saved.message));
            }
            tracing::info!(session_id, fields = fields.len(), "Schema saved");
        }

        let job = self.api.extract_data(session_id, intention).await?;
        let extraction = self.run_stage(JobStage::Extraction, job, &progress).await?;

        let job = self.api.index_data(session_id).await?;
        let indexing = self.run_stage(JobStage::Indexing, job, &progress).await?;

        Ok(ExtractionOutcome {
            extraction,
            indexing,
        })
    }

    /// Ask a question. If the query started a dynamic-extraction job, it
    /// is followed to completion and the session's dataset is re-fetched.
    pub async fn query<P>(
        &self,
        session_id: SessionId,
        text: &str,
        num_results: u32,
        progress: P,
    ) -> Result<QueryOutcome, PipelineError>
    where
        P: Fn(StageUpdate) + Send + Sync + 'static,
    {
        let response = self.api.query_data(session_id, text, num_results).await?;

        let Some(job_id) = response.started_job().cloned() else {
            return Ok(QueryOutcome::Answer(response));
        };

        let progress: Progress = Arc::new(progress);
        let job = JobResponse {
            job_id,
            message: response
                .function_result
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_default(),
        };
        let result = self
            .run_stage(JobStage::DynamicExtraction, job, &progress)
            .await?;
        let data = self.api.extracted_data(session_id).await?;

        Ok(QueryOutcome::DynamicExtraction {
            response,
            result,
            data,
        })
    }

    /// Build a knowledge graph from a query's relevant records.
    pub async fn graph(&self, response: &QueryResponse) -> Result<serde_json::Value, PipelineError> {
        if response.relevant_records.is_empty() {
            return Err(PipelineError::NoRelevantRecords);
        }

        let query_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            query_id = %query_id,
            records = response.relevant_records.len(),
            "Generating graph",
        );
        Ok(self
            .api
            .generate_graph(&response.relevant_records, &query_id)
            .await?)
    }

    async fn run_stage(
        &self,
        stage: JobStage,
        job: JobResponse,
        progress: &Progress,
    ) -> Result<Option<serde_json::Value>, PipelineError> {
        tracing::info!(
            stage = %stage,
            job_id = %job.job_id,
            message = %job.message,
            "Stage started",
        );

        let progress = Arc::clone(progress);
        let result = self
            .tracker
            .track_with_progress(job.job_id, move |update| {
                progress(StageUpdate {
                    stage,
                    update: update.clone(),
                })
            })
            .await;

        match &result {
            Ok(_) => tracing::info!(stage = %stage, "Stage completed"),
            Err(e) => tracing::warn!(stage = %stage, error = %e, "Stage failed"),
        }
        Ok(result?)
    }
}
