//! REST API client for the Lumina backend.
//!
//! Wraps the HTTP endpoints the client drives (uploads, orchestration
//! jobs, queries, exports, job status) using [`reqwest`]. Job-starting
//! endpoints return a [`JobResponse`] whose id is handed to the
//! [`JobTracker`](crate::tracker::JobTracker).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lumina_core::config::ClientConfig;
use lumina_core::types::{JobId, JobResponse, JobUpdate, SessionId};
use serde::{Deserialize, Serialize};

/// HTTP client for the Lumina backend.
pub struct LuminaApi {
    client: reqwest::Client,
    api_url: String,
}

/// Pull-based job status lookup used by the polling fallback.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// Fetch the current status snapshot of `job_id`.
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobUpdate, ApiError>;
}

/// Errors from the backend REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A local file could not be read for upload.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Result of the three-step upload flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSummary {
    pub session_id: SessionId,
    pub message: String,
    /// Client-side ids, `file-{session_id}-{index}`.
    pub file_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InitiateUploadResponse {
    session_id: SessionId,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct FinalizeUploadResponse {
    #[serde(default)]
    message: String,
}

/// One field of an extraction schema, as recommended by document analysis
/// and edited by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub field_name: String,
    pub description: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub example: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_rules: Option<String>,
}

/// Response of `POST /orchestrate/update-schema`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaUpdateResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// How the backend answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryResultType {
    /// Retrieval-augmented answer.
    Rag,
    /// A tool call completed synchronously (e.g. CSV export).
    Function,
    /// A tool call started an asynchronous dynamic-extraction job.
    FunctionJobStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySource {
    pub document_id: String,
    pub document_name: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevantRecord {
    pub text: String,
    pub relevance_score: f64,
    pub chunk_id: i64,
}

/// Outcome of a tool call made while answering a query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub new_field: Option<serde_json::Value>,
    #[serde(default)]
    pub new_records: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub records_updated: Option<u64>,
    #[serde(default)]
    pub sample_values: Option<Vec<serde_json::Value>>,
    /// Set when the tool call started a dynamic-extraction job.
    #[serde(default)]
    pub new_job_id: Option<JobId>,
}

/// Response of `POST /orchestrate/query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<QuerySource>,
    #[serde(default)]
    pub relevant_records: Vec<RelevantRecord>,
    #[serde(default)]
    pub result_type: Option<QueryResultType>,
    #[serde(default)]
    pub function_result: Option<FunctionResult>,
}

impl QueryResponse {
    /// The dynamic-extraction job started by this query, if any.
    pub fn started_job(&self) -> Option<&JobId> {
        if self.result_type != Some(QueryResultType::FunctionJobStart) {
            return None;
        }
        self.function_result.as_ref()?.new_job_id.as_ref()
    }
}

/// Export format accepted by `GET /export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

// ---------------------------------------------------------------------------
// LuminaApi
// ---------------------------------------------------------------------------

impl LuminaApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    /// Build a client with the configured base URL and request timeout.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config.api_base_url.clone()))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch the current status of a job.
    ///
    /// Sends `GET /jobs/{job_id}/status`. Unknown jobs come back as a 404
    /// and surface as [`ApiError::Status`].
    pub async fn job_status(&self, job_id: &JobId) -> Result<JobUpdate, ApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}/status", self.api_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Upload documents using the three-step session flow: initiate a
    /// session, upload each file, then finalize the session.
    pub async fn upload_files(&self, paths: &[PathBuf]) -> Result<UploadSummary, ApiError> {
        let filenames: Vec<String> = paths.iter().map(|p| file_name(p)).collect();

        let response = self
            .client
            .post(format!("{}/uploads/initiate", self.api_url))
            .json(&serde_json::json!({ "filenames": filenames }))
            .send()
            .await?;
        let session: InitiateUploadResponse = Self::parse_response(response).await?;
        let session_id = session.session_id;

        tracing::info!(session_id, files = paths.len(), "Upload session created");

        for (path, name) in paths.iter().zip(&filenames) {
            let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::Io {
                path: path.clone(),
                source,
            })?;
            let form = reqwest::multipart::Form::new()
                .text("session_id", session_id.to_string())
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes).file_name(name.clone()),
                );

            let response = self
                .client
                .post(format!("{}/uploads/file", self.api_url))
                .multipart(form)
                .send()
                .await?;
            let uploaded: FileUploadResponse = Self::parse_response(response).await?;

            tracing::info!(session_id, file = %name, status = %uploaded.status, "File uploaded");
        }

        let response = self
            .client
            .post(format!("{}/uploads/finalize/{}", self.api_url, session_id))
            .send()
            .await?;
        let finalized: FinalizeUploadResponse = Self::parse_response(response).await?;

        Ok(UploadSummary {
            session_id,
            message: finalized.message,
            file_ids: (0..paths.len())
                .map(|i| format!("file-{session_id}-{i}"))
                .collect(),
        })
    }

    /// Start document analysis (classification + schema recommendation).
    pub async fn analyze_documents(&self, session_id: SessionId) -> Result<JobResponse, ApiError> {
        self.post_json(
            "/orchestrate/analyze",
            &serde_json::json!({ "session_id": session_id }),
        )
        .await
    }

    /// Persist the user's edits to the recommended schema.
    pub async fn update_schema(
        &self,
        session_id: SessionId,
        intention: &str,
        fields: &[SchemaField],
    ) -> Result<SchemaUpdateResponse, ApiError> {
        self.post_json(
            "/orchestrate/update-schema",
            &serde_json::json!({
                "session_id": session_id,
                "intention": intention,
                "fields": fields,
            }),
        )
        .await
    }

    /// Start structured extraction for a session.
    pub async fn extract_data(
        &self,
        session_id: SessionId,
        intention: &str,
    ) -> Result<JobResponse, ApiError> {
        self.post_json(
            "/orchestrate/extract",
            &serde_json::json!({
                "session_id": session_id,
                "intention": intention,
            }),
        )
        .await
    }

    /// Start indexing the extracted records for retrieval.
    pub async fn index_data(&self, session_id: SessionId) -> Result<JobResponse, ApiError> {
        self.post_json(
            "/orchestrate/index",
            &serde_json::json!({ "session_id": session_id }),
        )
        .await
    }

    /// Ask a question about the indexed data.
    pub async fn query_data(
        &self,
        session_id: SessionId,
        query: &str,
        num_results: u32,
    ) -> Result<QueryResponse, ApiError> {
        self.post_json(
            "/orchestrate/query",
            &serde_json::json!({
                "session_id": session_id,
                "query": query,
                "num_results": num_results,
            }),
        )
        .await
    }

    /// Fetch the full extracted dataset (`records`, `fields`, `metadata`).
    pub async fn extracted_data(
        &self,
        session_id: SessionId,
    ) -> Result<serde_json::Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/session/{}/data", self.api_url, session_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download the extracted data in the given format.
    pub async fn export_data(&self, format: ExportFormat) -> Result<Vec<u8>, ApiError> {
        let response = self
            .client
            .get(format!("{}/export", self.api_url))
            .query(&[("format", format.as_str())])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Build a knowledge graph from the records relevant to a query.
    pub async fn generate_graph(
        &self,
        relevant_records: &[RelevantRecord],
        query_id: &str,
    ) -> Result<serde_json::Value, ApiError> {
        self.post_json(
            "/generate-graph",
            &serde_json::json!({
                "relevant_records": relevant_records,
                "query_id": query_id,
            }),
        )
        .await
    }

    /// Returns `true` if `GET /health` answers with a success status.
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.api_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                false
            }
        }
    }

    // ---- private helpers ----

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .json(body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl StatusSource for LuminaApi {
    async fn fetch_status(&self, job_id: &JobId) -> Result<JobUpdate, ApiError> {
        self.job_status(job_id).await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
