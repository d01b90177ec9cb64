//! Pipeline stages against an in-process fake backend that answers the
//! orchestration endpoints and pushes job updates over WebSocket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lumina_core::config::ClientConfig;
use lumina_core::types::JobStatus;
use lumina_jobs::api::{
    ApiError, QueryResponse, QueryResultType, RelevantRecord, SchemaField,
};
use lumina_jobs::tracker::TrackerError;
use lumina_pipeline::{
    JobStage, Pipeline, PipelineError, QueryOutcome, StageUpdate, DEFAULT_INTENTION,
};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Backend {
    /// Terminal frame pushed for each job id.
    outcomes: Mutex<HashMap<String, Value>>,
    /// Orchestration requests in arrival order: `(path, body)`.
    requests: Mutex<Vec<(String, Value)>>,
    query_response: Mutex<Value>,
    /// Makes `update-schema` answer `success: false`.
    reject_schema: AtomicBool,
}

impl Backend {
    fn complete(&self, job_id: &str, result: Value) {
        self.outcomes.lock().unwrap().insert(
            job_id.into(),
            json!({"job_id": job_id, "status": "COMPLETED", "message": "done", "result": result}),
        );
    }

    fn fail(&self, job_id: &str, message: &str) {
        self.outcomes.lock().unwrap().insert(
            job_id.into(),
            json!({"job_id": job_id, "status": "FAILED", "message": message}),
        );
    }

    fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn record(&self, path: &str, body: Value) {
        self.requests.lock().unwrap().push((path.into(), body));
    }
}

async fn ws_status(
    State(backend): State<Arc<Backend>>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(terminal) = backend.outcomes.lock().unwrap().get(&job_id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let progress = json!({"job_id": job_id, "status": "PROCESSING", "message": "working"});
    ws.on_upgrade(move |socket| push(socket, vec![progress, terminal]))
}

async fn push(mut socket: WebSocket, frames: Vec<Value>) {
    for frame in frames {
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn start_job(backend: &Backend, path: &str, body: Value, job_id: String) -> Json<Value> {
    backend.record(path, body);
    Json(json!({"job_id": job_id, "message": format!("{path} started")}))
}

async fn analyze(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let id = format!("analyze-{}", body["session_id"]);
    start_job(&b, "analyze", body, id).await
}

async fn extract(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let id = format!("extract-{}", body["session_id"]);
    start_job(&b, "extract", body, id).await
}

async fn index(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let id = format!("index-{}", body["session_id"]);
    start_job(&b, "index", body, id).await
}

async fn query(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    b.record("query", body);
    Json(b.query_response.lock().unwrap().clone())
}

async fn update_schema(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    b.record("update-schema", body);
    if b.reject_schema.load(Ordering::SeqCst) {
        Json(json!({"success": false, "message": "unknown data type: money"}))
    } else {
        Json(json!({"success": true, "message": "Schema updated"}))
    }
}

async fn session_data(State(b): State<Arc<Backend>>, Path(session_id): Path<i64>) -> Json<Value> {
    b.record("data", json!({"session_id": session_id}));
    Json(json!({
        "records": [{"vendor": "Acme"}],
        "fields": [{"name": "vendor", "type": "string"}],
        "metadata": {"session_id": session_id},
    }))
}

async fn generate_graph(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    b.record("generate-graph", body);
    Json(json!({"nodes": [{"id": "Acme"}], "edges": []}))
}

async fn spawn_backend(backend: Arc<Backend>) -> SocketAddr {
    let app = Router::new()
        .route("/ws/status/{job_id}", get(ws_status))
        .route("/orchestrate/analyze", post(analyze))
        .route("/orchestrate/extract", post(extract))
        .route("/orchestrate/index", post(index))
        .route("/orchestrate/query", post(query))
        .route("/orchestrate/update-schema", post(update_schema))
        .route("/session/{session_id}/data", get(session_data))
        .route("/generate-graph", post(generate_graph))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn pipeline(addr: SocketAddr) -> Pipeline {
    Pipeline::from_config(&ClientConfig {
        api_base_url: format!("http://{addr}"),
        ws_base_url: format!("ws://{addr}"),
        ..Default::default()
    })
    .unwrap()
}

type Seen = Arc<Mutex<Vec<StageUpdate>>>;

fn recorder() -> (Seen, impl Fn(StageUpdate) + Send + Sync + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |update| sink.lock().unwrap().push(update))
}

fn stages(seen: &Seen) -> Vec<(JobStage, JobStatus)> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|s| (s.stage, s.update.status))
        .collect()
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn analyze_returns_analysis_payload() {
    let backend = Arc::new(Backend::default());
    backend.complete("analyze-3", json!({"recommended_schema": {"fields": []}}));
    let addr = spawn_backend(backend.clone()).await;

    let (seen, progress) = recorder();
    let result = pipeline(addr).analyze(3, progress).await.unwrap();

    assert_eq!(result, Some(json!({"recommended_schema": {"fields": []}})));
    assert_eq!(
        stages(&seen),
        vec![
            (JobStage::Analysis, JobStatus::Processing),
            (JobStage::Analysis, JobStatus::Completed)
        ]
    );
}

// ---------------------------------------------------------------------------
// Extraction + indexing
// ---------------------------------------------------------------------------

/// Indexing starts only after extraction completed; progress of both jobs
/// is tagged with its stage.
#[tokio::test]
async fn extract_then_index_in_order() {
    let backend = Arc::new(Backend::default());
    backend.complete("extract-5", json!({"records": 12}));
    backend.complete("index-5", json!({"indexed": 12}));
    let addr = spawn_backend(backend.clone()).await;

    let (seen, progress) = recorder();
    let outcome = pipeline(addr)
        .extract_and_index(5, "invoice totals", None, progress)
        .await
        .unwrap();

    assert_eq!(outcome.extraction, Some(json!({"records": 12})));
    assert_eq!(outcome.indexing, Some(json!({"indexed": 12})));
    assert_eq!(backend.paths(), vec!["extract", "index"]);
    assert_eq!(
        backend.requests.lock().unwrap()[0].1["intention"],
        "invoice totals"
    );
    assert_eq!(
        stages(&seen),
        vec![
            (JobStage::Extraction, JobStatus::Processing),
            (JobStage::Extraction, JobStatus::Completed),
            (JobStage::Indexing, JobStatus::Processing),
            (JobStage::Indexing, JobStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn blank_intention_uses_default() {
    let backend = Arc::new(Backend::default());
    backend.complete("extract-6", json!(null));
    backend.complete("index-6", json!(null));
    let addr = spawn_backend(backend.clone()).await;

    let (_seen, progress) = recorder();
    pipeline(addr)
        .extract_and_index(6, "   ", None, progress)
        .await
        .unwrap();

    assert_eq!(
        backend.requests.lock().unwrap()[0].1["intention"],
        DEFAULT_INTENTION
    );
}

fn vendor_field() -> SchemaField {
    SchemaField {
        field_name: "vendor".into(),
        description: "Supplier name".into(),
        data_type: "string".into(),
        unit: None,
        example: "Acme".into(),
        validation_rules: None,
    }
}

/// An edited schema is saved with the intention before extraction starts.
#[tokio::test]
async fn schema_is_saved_before_extraction() {
    let backend = Arc::new(Backend::default());
    backend.complete("extract-9", json!({"records": 3}));
    backend.complete("index-9", json!({"indexed": 3}));
    let addr = spawn_backend(backend.clone()).await;

    let (_seen, progress) = recorder();
    let fields = [vendor_field()];
    pipeline(addr)
        .extract_and_index(9, "invoice vendors", Some(&fields[..]), progress)
        .await
        .unwrap();

    assert_eq!(backend.paths(), vec!["update-schema", "extract", "index"]);
    let schema = backend.requests.lock().unwrap()[0].1.clone();
    assert_eq!(schema["session_id"], 9);
    assert_eq!(schema["intention"], "invoice vendors");
    assert_eq!(schema["fields"][0]["field_name"], "vendor");
}

#[tokio::test]
async fn rejected_schema_stops_before_extraction() {
    let backend = Arc::new(Backend::default());
    backend.reject_schema.store(true, Ordering::SeqCst);
    let addr = spawn_backend(backend.clone()).await;

    let (seen, progress) = recorder();
    let fields = [vendor_field()];
    let err = pipeline(addr)
        .extract_and_index(9, "", Some(&fields[..]), progress)
        .await
        .unwrap_err();

    assert_matches!(err, PipelineError::SchemaRejected(ref m) if m == "unknown data type: money");
    assert_eq!(backend.paths(), vec!["update-schema"]);
    assert_eq!(
        backend.requests.lock().unwrap()[0].1["intention"],
        DEFAULT_INTENTION
    );
    assert!(seen.lock().unwrap().is_empty());
}

/// A failed extraction stops the pipeline before indexing.
#[tokio::test]
async fn failed_extraction_skips_indexing() {
    let backend = Arc::new(Backend::default());
    backend.fail("extract-8", "no documents in session");
    let addr = spawn_backend(backend.clone()).await;

    let (_seen, progress) = recorder();
    let err = pipeline(addr)
        .extract_and_index(8, "", None, progress)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "no documents in session");
    assert_matches!(err, PipelineError::Tracker(TrackerError::JobFailed { .. }));
    assert_eq!(backend.paths(), vec!["extract"]);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rag_query_is_answered_directly() {
    let backend = Arc::new(Backend::default());
    *backend.query_response.lock().unwrap() = json!({
        "query": "total spend?",
        "answer": "4,200 EUR",
        "confidence": 0.9,
        "sources": [],
        "result_type": "rag",
    });
    let addr = spawn_backend(backend.clone()).await;

    let (seen, progress) = recorder();
    let outcome = pipeline(addr)
        .query(2, "total spend?", 5, progress)
        .await
        .unwrap();

    assert_matches!(outcome, QueryOutcome::Answer(ref r) if r.answer == "4,200 EUR");
    assert_eq!(outcome.response().result_type, Some(QueryResultType::Rag));
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(backend.requests.lock().unwrap()[0].1["num_results"], 5);
}

/// A query that started a dynamic-extraction job is followed to completion.
#[tokio::test]
async fn function_job_start_is_tracked() {
    let backend = Arc::new(Backend::default());
    *backend.query_response.lock().unwrap() = json!({
        "query": "add a vendor column",
        "answer": "Started extracting vendor.",
        "result_type": "function_job_start",
        "function_result": {
            "success": true,
            "message": "Dynamic extraction started",
            "new_job_id": "dyn-1",
        },
    });
    backend.complete("dyn-1", json!({"records_updated": 12}));
    let addr = spawn_backend(backend.clone()).await;

    let (seen, progress) = recorder();
    let outcome = pipeline(addr)
        .query(2, "add a vendor column", 5, progress)
        .await
        .unwrap();

    assert_matches!(
        outcome,
        QueryOutcome::DynamicExtraction { ref result, .. }
            if result == &Some(json!({"records_updated": 12}))
    );
    assert_eq!(
        stages(&seen),
        vec![
            (JobStage::DynamicExtraction, JobStatus::Processing),
            (JobStage::DynamicExtraction, JobStatus::Completed)
        ]
    );
}

/// Once the dynamic-extraction job finished, the session's dataset is
/// fetched again and returned with the outcome.
#[tokio::test]
async fn dynamic_extraction_refreshes_dataset() {
    let backend = Arc::new(Backend::default());
    *backend.query_response.lock().unwrap() = json!({
        "query": "add a vendor column",
        "answer": "Started extracting vendor.",
        "result_type": "function_job_start",
        "function_result": {"success": true, "message": "started", "new_job_id": "dyn-2"},
    });
    backend.complete("dyn-2", json!({"records_updated": 1}));
    let addr = spawn_backend(backend.clone()).await;

    let (_seen, progress) = recorder();
    let outcome = pipeline(addr)
        .query(4, "add a vendor column", 5, progress)
        .await
        .unwrap();

    assert_matches!(
        outcome,
        QueryOutcome::DynamicExtraction { ref data, .. }
            if data["records"][0]["vendor"] == "Acme" && data["metadata"]["session_id"] == 4
    );
    assert_eq!(backend.paths(), vec!["query", "data"]);
}

#[tokio::test]
async fn answered_query_does_not_refresh_dataset() {
    let backend = Arc::new(Backend::default());
    *backend.query_response.lock().unwrap() = json!({
        "query": "export csv",
        "answer": "Exported 12 records.",
        "result_type": "function",
        "function_result": {"success": true, "message": "ok", "record_count": 12},
    });
    let addr = spawn_backend(backend.clone()).await;

    let (_seen, progress) = recorder();
    let outcome = pipeline(addr)
        .query(4, "export csv", 5, progress)
        .await
        .unwrap();

    assert_matches!(outcome, QueryOutcome::Answer(_));
    assert_eq!(backend.paths(), vec!["query"]);
}

// ---------------------------------------------------------------------------
// Graphs
// ---------------------------------------------------------------------------

fn response_with_records(records: Vec<RelevantRecord>) -> QueryResponse {
    QueryResponse {
        query: "who are the vendors?".into(),
        answer: "Acme".into(),
        confidence: 0.8,
        sources: Vec::new(),
        relevant_records: records,
        result_type: Some(QueryResultType::Rag),
        function_result: None,
    }
}

#[tokio::test]
async fn graph_is_built_from_relevant_records() {
    let backend = Arc::new(Backend::default());
    let addr = spawn_backend(backend.clone()).await;
    let response = response_with_records(vec![RelevantRecord {
        text: "Acme invoice".into(),
        relevance_score: 0.9,
        chunk_id: 1,
    }]);

    let graph = pipeline(addr).graph(&response).await.unwrap();

    assert_eq!(graph["nodes"][0]["id"], "Acme");
    let (path, body) = backend.requests.lock().unwrap()[0].clone();
    assert_eq!(path, "generate-graph");
    assert_eq!(body["relevant_records"][0]["chunkId"], 1);
    let query_id = body["query_id"].as_str().unwrap();
    assert_eq!(query_id.len(), 36);
}

#[tokio::test]
async fn graph_without_records_is_rejected_locally() {
    let backend = Arc::new(Backend::default());
    let addr = spawn_backend(backend.clone()).await;

    let err = pipeline(addr)
        .graph(&response_with_records(Vec::new()))
        .await
        .unwrap_err();

    assert_matches!(err, PipelineError::NoRelevantRecords);
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn api_errors_surface_as_pipeline_errors() {
    // No backend listening.
    let (_seen, progress) = recorder();
    let err = pipeline("127.0.0.1:9".parse().unwrap())
        .analyze(1, progress)
        .await
        .unwrap_err();

    assert_matches!(err, PipelineError::Api(ApiError::Request(_)));
}
