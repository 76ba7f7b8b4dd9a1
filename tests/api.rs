//! HTTP API tests driving the router in-process.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use logwarden::api::{self, state::AppState};
use logwarden::assistant::{Assistant, CompletionError, CompletionService, FALLBACK_REPLY};
use logwarden::cache::MemoryCache;
use logwarden::config::DetectorConfig;
use logwarden::detect::ScoringEngine;
use logwarden::metrics::Metrics;
use logwarden::record::{LogFilter, LogLevel, LogRecord};
use logwarden::source::{LogSource, MemoryLogSource};
use logwarden::storage::SqliteLogStore;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct EchoCompletion {
    calls: AtomicUsize,
    up: bool,
}

#[async_trait::async_trait]
impl CompletionService for EchoCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.up {
            return Err(CompletionError::Unavailable("connection refused".into()));
        }
        Ok(format!("Try checking: {}", prompt))
    }
}

struct Harness {
    state: AppState,
    source: Arc<MemoryLogSource>,
    completion: Arc<EchoCompletion>,
}

fn harness(records: Vec<LogRecord>, completion_up: bool) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let source = Arc::new(MemoryLogSource::new(records));
    let dyn_source: Arc<dyn LogSource> = source.clone();
    let completion = Arc::new(EchoCompletion {
        calls: AtomicUsize::new(0),
        up: completion_up,
    });
    let state = AppState {
        engine: Arc::new(ScoringEngine::new(
            dyn_source.clone(),
            DetectorConfig::default(),
            metrics.clone(),
        )),
        assistant: Arc::new(Assistant::new(
            completion.clone(),
            Arc::new(MemoryCache::<String>::new(64)),
            Duration::from_secs(3600),
            metrics.clone(),
        )),
        source: dyn_source,
        store: None,
        metrics,
    };
    Harness {
        state,
        source,
        completion,
    }
}

/// Same wiring as `build_state`: the SQLite store is both the log source and
/// the audit sink.
fn store_harness(store: SqliteLogStore) -> (AppState, Arc<EchoCompletion>) {
    let metrics = Arc::new(Metrics::new());
    let source: Arc<dyn LogSource> = Arc::new(store.clone());
    let completion = Arc::new(EchoCompletion {
        calls: AtomicUsize::new(0),
        up: true,
    });
    let state = AppState {
        engine: Arc::new(ScoringEngine::new(
            source.clone(),
            DetectorConfig::default(),
            metrics.clone(),
        )),
        assistant: Arc::new(Assistant::new(
            completion.clone(),
            Arc::new(MemoryCache::<String>::new(64)),
            Duration::from_secs(3600),
            metrics.clone(),
        )),
        source,
        store: Some(store),
        metrics,
    };
    (state, completion)
}

fn audit_rows(store: &SqliteLogStore, pipeline: &str) -> Vec<LogRecord> {
    let filter = LogFilter {
        pipeline: Some(pipeline.to_string()),
        level: None,
    };
    store.query(100, &filter).unwrap()
}

fn pipeline_logs() -> Vec<LogRecord> {
    let ts = Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap();
    let mut records: Vec<LogRecord> = (0..59)
        .map(|i| LogRecord::new(LogLevel::Info, format!("chunk {} loaded", i), Some("ETL_Job_2")).at(ts))
        .collect();
    records.push(LogRecord::new(LogLevel::Critical, "Kafka consumer lag exceeded", Some("ETL_Job_2")).at(ts));
    records
}

async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
    let resp = api::router(state.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness(Vec::new(), true);
    let (status, body) = send(&h.state, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["data"]["model"].is_null());
}

#[tokio::test]
async fn test_anomalies_flags_the_critical_record() {
    let h = harness(pipeline_logs(), true);
    let (status, body) = send(&h.state, get("/api/v1/anomalies")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "scored");
    assert_eq!(body["data"]["total_logs"], 60);
    assert_eq!(body["data"]["anomalies_found"], 1);
    assert_eq!(body["data"]["anomalies"][0]["level"], "CRITICAL");
    assert_eq!(body["data"]["anomalies"][0]["pipeline"], "ETL_Job_2");
    assert!(body["meta"]["processing_time_ms"].is_number());
}

#[tokio::test]
async fn test_anomalies_with_unmatched_filter_is_no_data() {
    let h = harness(pipeline_logs(), true);
    let (status, body) = send(&h.state, get("/api/v1/anomalies?pipeline=nope")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "no_data");
    assert_eq!(body["data"]["anomalies_found"], 0);
}

#[tokio::test]
async fn test_anomalies_source_down_is_unavailable_report() {
    let h = harness(pipeline_logs(), true);
    h.source.set_unavailable(true);
    let (status, body) = send(&h.state, get("/api/v1/anomalies")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "unavailable");
    assert_eq!(body["data"]["total_logs"], 0);
    assert_eq!(body["data"]["anomalies_found"], 0);
    assert!(body["data"]["model_version"].is_null());
}

#[tokio::test]
async fn test_logs_default_limit_and_level_filter() {
    let h = harness(pipeline_logs(), true);
    let (status, body) = send(&h.state, get("/api/v1/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 10);

    let (_, body) = send(&h.state, get("/api/v1/logs?level=critical&limit=5")).await;
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["message"], "Kafka consumer lag exceeded");
}

#[tokio::test]
async fn test_retrain_status_codes() {
    let h = harness(Vec::new(), true);
    let (status, body) = send(&h.state, post_json("/api/v1/retrain", "")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["type"], "insufficient_data");

    h.source.replace(pipeline_logs());
    let (status, body) = send(&h.state, post_json("/api/v1/retrain", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 2);
    assert_eq!(body["data"]["sample_size"], 60);

    h.source.set_unavailable(true);
    let (status, _) = send(&h.state, post_json("/api/v1/retrain", "")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_chat_caches_answers() {
    let h = harness(Vec::new(), true);
    let (status, body) = send(&h.state, post_json("/api/v1/chat", r#"{"message":"Spark OOM?"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["response"], "Try checking: Spark OOM?");
    assert_eq!(body["meta"]["cache_hit"], false);

    let (_, body) = send(&h.state, post_json("/api/v1/chat", r#"{"message":"  Spark   OOM? "}"#)).await;
    assert_eq!(body["meta"]["cache_hit"], true);
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_chat_rejects_blank_message() {
    let h = harness(Vec::new(), true);
    for payload in [r#"{"message":"   "}"#, "{}", "not json"] {
        let (status, body) = send(&h.state, post_json("/api/v1/chat", payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "missing_message");
    }
    assert_eq!(h.state.metrics.api_errors("/chat", "missing_message"), 3);
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_chat_upstream_failure_returns_fallback() {
    let h = harness(Vec::new(), false);
    let (status, body) = send(&h.state, post_json("/api/v1/chat", r#"{"message":"hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["response"], FALLBACK_REPLY);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let h = harness(pipeline_logs(), true);
    send(&h.state, get("/api/v1/anomalies")).await;
    send(&h.state, get("/api/v1/anomalies")).await;
    send(&h.state, post_json("/api/v1/chat", "{}")).await;

    let resp = api::router(h.state.clone()).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains(r#"logwarden_requests_total{method="GET",endpoint="/api/v1/anomalies",status="200"} 2"#));
    assert!(text.contains(r#"logwarden_requests_total{method="POST",endpoint="/api/v1/chat",status="400"} 1"#));
    assert!(text.contains(r#"logwarden_request_latency_seconds_count{endpoint="/api/v1/anomalies"} 2"#));
    assert!(text.contains(r#"logwarden_request_latency_seconds_bucket{endpoint="/api/v1/anomalies",le="+Inf"} 2"#));
    assert!(text.contains(r#"logwarden_response_size_bytes_count{endpoint="/api/v1/chat"} 1"#));
    // the /metrics request itself is still in flight while rendering
    assert!(text.contains("logwarden_active_requests 1"));
    assert!(text.contains("logwarden_anomalies_detected_total 2"));
    assert!(text.contains("logwarden_train_runs_total 1"));

    assert_eq!(h.state.metrics.active_requests(), 0);
    assert_eq!(h.state.metrics.requests("GET", "/metrics", 200), 1);
}

#[tokio::test]
async fn test_index_lists_endpoints() {
    let h = harness(Vec::new(), true);
    for uri in ["/", "/api/v1"] {
        let (status, body) = send(&h.state, get(uri)).await;
        assert_eq!(status, StatusCode::OK, "{}", uri);
        assert_eq!(body["data"]["name"], "logwarden");
        assert!(body["data"]["endpoints"]["POST /api/v1/chat"].is_string());
    }
}

#[tokio::test]
async fn test_activity_is_audited_to_the_store() {
    let store = SqliteLogStore::open_in_memory().unwrap();
    store.insert_many(&pipeline_logs()).unwrap();
    let (state, completion) = store_harness(store.clone());

    let (status, body) = send(&state, get("/api/v1/anomalies")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "scored");

    for _ in 0..2 {
        let (status, _) = send(&state, post_json("/api/v1/chat", r#"{"message":"Why did ETL_Job_2 stall?"}"#)).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);

    let detector = audit_rows(&store, "ANOMALY_DETECTOR");
    assert_eq!(detector.len(), 1);
    assert_eq!(detector[0].level, LogLevel::Info);
    assert!(detector[0].message.contains("Found 1 anomalies"));

    let chat = audit_rows(&store, "CHATBOT");
    assert_eq!(chat.len(), 1);
    assert!(chat[0].message.starts_with("User query: Why did ETL_Job_2 stall?..."));
    assert!(chat[0].message.ends_with(&format!("Response length: {}", "Try checking: Why did ETL_Job_2 stall?".len())));

    let cached = audit_rows(&store, "CHATBOT_CACHED");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].message, "Cached response for: Why did ETL_Job_2 stall?...");
}

#[tokio::test]
async fn test_failed_audit_write_does_not_fail_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("logs.db");
    let store = SqliteLogStore::open(&db).unwrap();
    let (state, _) = store_harness(store);

    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch("DROP TABLE logs;")
        .unwrap();

    let (status, body) = send(&state, post_json("/api/v1/chat", r#"{"message":"Spark OOM?"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["response"], "Try checking: Spark OOM?");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let h = harness(Vec::new(), true);
    let (status, _) = send(&h.state, get("/api/v1/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
