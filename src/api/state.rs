use crate::assistant::Assistant;
use crate::detect::ScoringEngine;
use crate::metrics::Metrics;
use crate::source::LogSource;
use crate::storage::SqliteLogStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScoringEngine>,
    pub assistant: Arc<Assistant>,
    pub source: Arc<dyn LogSource>,
    /// Present when logs live in SQLite; feeds the per-level gauge.
    pub store: Option<SqliteLogStore>,
    pub metrics: Arc<Metrics>,
}
