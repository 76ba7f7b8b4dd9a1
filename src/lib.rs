//! Logwarden -- Unsupervised anomaly detection for data-pipeline logs.
//!
//! This crate provides an isolation-forest scoring engine over pipeline log
//! records, a content-addressed response cache for the pipeline assistant,
//! and the SQLite store and HTTP API that host them.

pub mod api;
pub mod assistant;
pub mod cache;
pub mod config;
pub mod detect;
pub mod metrics;
pub mod record;
pub mod source;
pub mod storage;

use anyhow::{Context, Result};
use std::sync::Arc;

/// Wire the store, engine and assistant together from configuration.
pub fn build_state(config: &config::AppConfig) -> Result<api::state::AppState> {
    let metrics = metrics::Metrics::global();

    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let store = storage::SqliteLogStore::open(&config.storage.db_path)?;
    let source: Arc<dyn source::LogSource> = Arc::new(store.clone());

    let engine = Arc::new(detect::ScoringEngine::new(
        source.clone(),
        config.detector.clone(),
        metrics.clone(),
    ));

    let completion = assistant::OpenAiCompletion::from_config(&config.completion)
        .context("building completion client")?;
    if !completion.has_api_key() {
        tracing::warn!(var = %config.completion.api_key_env, "No completion API key, chat will use the fallback reply");
    }
    let cache = Arc::new(cache::MemoryCache::<String>::new(config.cache.max_entries));
    let assistant = Arc::new(assistant::Assistant::new(
        Arc::new(completion),
        cache,
        config.cache.ttl(),
        metrics.clone(),
    ));

    Ok(api::state::AppState {
        engine,
        assistant,
        source,
        store: Some(store),
        metrics,
    })
}

/// Start the Logwarden daemon: pre-train the model, then serve the API.
pub async fn serve(config: config::AppConfig) -> Result<()> {
    let state = build_state(&config)?;

    // A failed pre-train is not fatal; detection retries lazily.
    match state.engine.train(None).await {
        Ok(summary) => tracing::info!(
            version = summary.version,
            sample = summary.sample_size,
            threshold = summary.threshold,
            "Initial model trained"
        ),
        Err(e) => tracing::warn!(error = %e, "Initial training skipped"),
    }

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "Logwarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
