//! Unsupervised anomaly detection over pipeline logs.
//!
//! Records flow through [`features::extract`], the [`scaler`] and an
//! [`forest::IsolationForest`]; [`engine::ScoringEngine`] owns the trained
//! triple and swaps it atomically on retrain.

pub mod engine;
pub mod features;
pub mod forest;
pub mod scaler;

pub use engine::{ModelSnapshot, ScoringEngine, TrainSummary};
pub use features::{extract, FeatureVector};

use crate::record::LogRecord;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DetectError {
    #[error("insufficient training data: {0}")]
    InsufficientData(String),

    #[error("feature dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("training task aborted: {0}")]
    TrainingAborted(String),
}

/// Verdict for one scored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub record: LogRecord,
    pub anomalous: bool,
    pub score: f64,
}

/// Why a detection returned what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    /// The batch was scored against a model. Zero flags is a real answer.
    Scored,
    /// Nothing to score: the batch or the source was empty.
    NoData,
    /// No model exists and none could be trained from the source.
    InsufficientData,
    /// The log source could not be reached.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    pub status: DetectionStatus,
    /// Version of the model snapshot that scored the batch.
    pub model_version: Option<u64>,
    pub threshold: Option<f64>,
    pub verdicts: Vec<Verdict>,
}

impl DetectionReport {
    pub fn empty(status: DetectionStatus) -> Self {
        Self {
            status,
            model_version: None,
            threshold: None,
            verdicts: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.verdicts.len()
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.anomalous)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies().count()
    }
}
