//! API route definitions.

use super::state::AppState;
use crate::detect::DetectError;
use crate::record::{LogFilter, LogLevel, LogRecord};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{error, warn};

const DEFAULT_ANOMALY_LIMIT: usize = 100;
const DEFAULT_LOG_LIMIT: usize = 10;

/// Pipeline names for the service's own audit records.
pub const AUDIT_CHAT: &str = "CHATBOT";
pub const AUDIT_CHAT_CACHED: &str = "CHATBOT_CACHED";
pub const AUDIT_DETECTOR: &str = "ANOMALY_DETECTOR";

const AUDIT_PREFIX_CHARS: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/anomalies", get(anomalies))
        .route("/logs", get(logs))
        .route("/retrain", post(retrain))
        .route("/chat", post(chat))
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(state: &AppState, endpoint: &str, status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    state.metrics.inc_api_error(endpoint, kind);
    (
        status,
        Json(json!({
            "error": { "type": kind, "message": message.into() },
            "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
        })),
    )
}

/// Append an INFO record describing service activity to the log store.
///
/// Only done when logs live in SQLite. Failures are logged and swallowed.
async fn audit(state: &AppState, pipeline: &'static str, message: String) {
    let Some(store) = state.store.clone() else {
        return;
    };
    let record = LogRecord::new(LogLevel::Info, message, Some(pipeline));
    match tokio::task::spawn_blocking(move || store.insert(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, pipeline, "Cannot write audit record"),
        Err(e) => warn!(error = %e, pipeline, "Audit write task failed"),
    }
}

fn prefix(text: &str) -> String {
    text.chars().take(AUDIT_PREFIX_CHARS).collect()
}

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    pipeline: Option<String>,
    level: Option<String>,
    limit: Option<usize>,
}

impl LogQuery {
    fn filter(&self) -> LogFilter {
        LogFilter {
            pipeline: self.pipeline.clone().filter(|p| !p.is_empty()),
            level: self.level.as_deref().filter(|l| !l.is_empty()).map(LogLevel::parse),
        }
    }
}

pub(super) async fn index() -> Json<Value> {
    Json(json!({
        "data": {
            "name": "logwarden",
            "description": env!("CARGO_PKG_DESCRIPTION"),
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": {
                "GET /api/v1/health": "Service status and current model",
                "GET /api/v1/anomalies": "Score recent logs (?pipeline=&level=&limit=)",
                "GET /api/v1/logs": "Recent logs (?pipeline=&level=&limit=)",
                "POST /api/v1/retrain": "Retrain the model from the log store",
                "POST /api/v1/chat": "Ask the pipeline assistant ({\"message\": ..})",
                "GET /metrics": "Prometheus metrics"
            }
        },
        "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let model = state.engine.snapshot().map(|m| {
        json!({
            "version": m.version,
            "sample_size": m.sample_size,
            "threshold": m.threshold(),
            "trained_at": m.trained_at.to_rfc3339(),
        })
    });
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "model": model
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn anomalies(State(state): State<AppState>, Query(q): Query<LogQuery>) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let limit = q.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT);

    let report = state.engine.detect_latest(limit, &q.filter()).await.map_err(|e| {
        error!(error = %e, "Detection failed");
        api_error(&state, "/anomalies", StatusCode::INTERNAL_SERVER_ERROR, "detection_failed", e.to_string())
    })?;

    let flagged: Vec<Value> = report
        .anomalies()
        .map(|v| {
            json!({
                "timestamp": v.record.timestamp.map(|t| t.to_rfc3339()),
                "level": v.record.level,
                "message": v.record.message,
                "pipeline": v.record.pipeline,
                "score": v.score,
            })
        })
        .collect();

    let elapsed = started.elapsed();
    audit(
        &state,
        AUDIT_DETECTOR,
        format!(
            "Anomaly detection completed in {:.2}s. Found {} anomalies.",
            elapsed.as_secs_f64(),
            flagged.len()
        ),
    )
    .await;

    Ok(Json(json!({
        "data": {
            "status": report.status,
            "total_logs": report.total(),
            "anomalies_found": flagged.len(),
            "model_version": report.model_version,
            "threshold": report.threshold,
            "anomalies": flagged,
        },
        "meta": {
            "processing_time_ms": elapsed.as_secs_f64() * 1000.0,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    })))
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogQuery>) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let records = state.source.fetch(limit, &q.filter()).await.map_err(|e| {
        api_error(&state, "/logs", StatusCode::SERVICE_UNAVAILABLE, "source_unavailable", e.to_string())
    })?;
    let total = records.len();
    Ok(Json(json!({ "data": records, "meta": { "total": total } })))
}

async fn retrain(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.engine.train(None).await {
        Ok(summary) => Ok(Json(json!({ "data": summary, "meta": { "status": "trained" } }))),
        Err(e @ DetectError::InsufficientData(_)) => Err(api_error(
            &state,
            "/retrain",
            StatusCode::UNPROCESSABLE_ENTITY,
            "insufficient_data",
            e.to_string(),
        )),
        Err(e @ DetectError::UpstreamUnavailable(_)) => Err(api_error(
            &state,
            "/retrain",
            StatusCode::SERVICE_UNAVAILABLE,
            "source_unavailable",
            e.to_string(),
        )),
        Err(e) => Err(api_error(
            &state,
            "/retrain",
            StatusCode::INTERNAL_SERVER_ERROR,
            "training_failed",
            e.to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: Option<String>,
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let message = serde_json::from_slice::<ChatRequest>(&body)
        .ok()
        .and_then(|req| req.message)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| {
            api_error(&state, "/chat", StatusCode::BAD_REQUEST, "missing_message", "message is required")
        })?;

    let reply = state.assistant.cached_completion(&message).await;
    if reply.cache_hit {
        audit(&state, AUDIT_CHAT_CACHED, format!("Cached response for: {}...", prefix(&message))).await;
    } else {
        audit(
            &state,
            AUDIT_CHAT,
            format!(
                "User query: {}... | Response length: {}",
                prefix(&message),
                reply.text.chars().count()
            ),
        )
        .await;
    }
    Ok(Json(json!({
        "data": { "response": reply.text },
        "meta": { "cache_hit": reply.cache_hit }
    })))
}

pub(super) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(store) = state.store.clone() {
        match tokio::task::spawn_blocking(move || store.count_by_level()).await {
            Ok(Ok(counts)) => {
                for (level, n) in counts {
                    state.metrics.set_log_count(&level, n);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Cannot refresh log counts"),
            Err(e) => warn!(error = %e, "Log count task failed"),
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
