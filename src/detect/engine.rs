use crate::config::DetectorConfig;
use crate::detect::features;
use crate::detect::forest::{ForestParams, IsolationForest};
use crate::detect::scaler::{self, ScalerState};
use crate::detect::{DetectError, DetectionReport, DetectionStatus, Verdict};
use crate::metrics::Metrics;
use crate::record::{LogFilter, LogRecord};
use crate::source::LogSource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Scaler, forest and threshold fitted together. Never mutated after `fit`.
#[derive(Debug)]
pub struct ModelSnapshot {
    pub version: u64,
    pub scaler: ScalerState,
    pub forest: IsolationForest,
    pub sample_size: usize,
    pub trained_at: DateTime<Utc>,
}

impl ModelSnapshot {
    /// Extract, normalise and fit a forest over `records`.
    pub fn fit(records: &[LogRecord], params: &ForestParams, version: u64) -> Result<Self, DetectError> {
        let vectors = features::extract_all(records);
        let scaler = scaler::fit(&vectors)?;
        let normalized = scaler::transform(&vectors, &scaler)?;
        let forest = IsolationForest::fit(&normalized, params)?;
        Ok(Self {
            version,
            scaler,
            forest,
            sample_size: records.len(),
            trained_at: Utc::now(),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.forest.threshold()
    }

    pub fn score_record(&self, record: &LogRecord) -> Result<f64, DetectError> {
        let row = self.scaler.transform_row(features::extract(record).as_slice())?;
        self.forest.score(&row)
    }

    pub fn classify(&self, records: Vec<LogRecord>) -> Result<Vec<Verdict>, DetectError> {
        records
            .into_iter()
            .map(|record| {
                let score = self.score_record(&record)?;
                Ok(Verdict {
                    anomalous: self.forest.is_anomaly(score),
                    record,
                    score,
                })
            })
            .collect()
    }
}

/// Outcome of a successful training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub version: u64,
    pub sample_size: usize,
    pub threshold: f64,
    pub duration_ms: u64,
}

/// Trains and serves the isolation forest over pipeline logs.
///
/// The current model lives behind a single `RwLock<Option<Arc<_>>>`. Training
/// builds a complete snapshot off to the side and only takes the write lock to
/// swap the pointer, so detection against the previous model never stalls.
pub struct ScoringEngine {
    source: Arc<dyn LogSource>,
    config: DetectorConfig,
    metrics: Arc<Metrics>,
    current: RwLock<Option<Arc<ModelSnapshot>>>,
    versions: AtomicU64,
    // Coalesces concurrent implicit trains; holds the last failure so
    // waiters that queued behind a run share its outcome.
    implicit_gate: tokio::sync::Mutex<Option<DetectError>>,
    implicit_runs: AtomicU64,
}

impl ScoringEngine {
    pub fn new(source: Arc<dyn LogSource>, config: DetectorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            source,
            config,
            metrics,
            current: RwLock::new(None),
            versions: AtomicU64::new(0),
            implicit_gate: tokio::sync::Mutex::new(None),
            implicit_runs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// The model currently serving, if any.
    pub fn snapshot(&self) -> Option<Arc<ModelSnapshot>> {
        self.current.read().clone()
    }

    pub fn is_trained(&self) -> bool {
        self.current.read().is_some()
    }

    /// Train a new model and swap it in.
    ///
    /// With `None` the latest `train_sample_limit` records are fetched from the
    /// log source. On any failure the previously serving model stays in place.
    pub async fn train(&self, sample: Option<Vec<LogRecord>>) -> Result<TrainSummary, DetectError> {
        let started = Instant::now();
        let result = self.train_inner(sample).await;
        self.metrics.observe_train(started.elapsed(), result.is_ok());
        result.map(|mut summary| {
            summary.duration_ms = started.elapsed().as_millis() as u64;
            summary
        })
    }

    async fn train_inner(&self, sample: Option<Vec<LogRecord>>) -> Result<TrainSummary, DetectError> {
        let records = match sample {
            Some(records) => records,
            None => self
                .source
                .fetch(self.config.train_sample_limit, &LogFilter::default())
                .await
                .map_err(|e| {
                    warn!(error = %e, "cannot fetch training sample");
                    DetectError::UpstreamUnavailable(e.to_string())
                })?,
        };

        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let params = self.config.forest_params();
        info!(version, sample = records.len(), trees = params.n_trees, "Training isolation forest");

        // CPU-bound; keep it off the async workers
        let built = tokio::task::spawn_blocking(move || ModelSnapshot::fit(&records, &params, version))
            .await
            .map_err(|e| DetectError::TrainingAborted(e.to_string()))?;

        let snapshot = match built {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(version, error = %e, "Training failed, keeping previous model");
                return Err(e);
            }
        };

        let summary = TrainSummary {
            version,
            sample_size: snapshot.sample_size,
            threshold: snapshot.threshold(),
            duration_ms: 0,
        };

        *self.current.write() = Some(snapshot);
        info!(version, threshold = summary.threshold, "Model swapped in");
        Ok(summary)
    }

    /// Return the serving model, training one from the source if none exists.
    ///
    /// Concurrent callers that find no model queue on a single gate; only the
    /// first runs training, the rest reuse its result.
    async fn ensure_trained(&self) -> Result<Arc<ModelSnapshot>, DetectError> {
        if let Some(snapshot) = self.snapshot() {
            return Ok(snapshot);
        }

        let observed = self.implicit_runs.load(Ordering::Acquire);
        let mut last_failure = self.implicit_gate.lock().await;

        if let Some(snapshot) = self.snapshot() {
            return Ok(snapshot);
        }
        if self.implicit_runs.load(Ordering::Acquire) != observed {
            if let Some(err) = last_failure.clone() {
                debug!(error = %err, "Joined a concurrent implicit training run");
                return Err(err);
            }
        }

        info!("No model loaded, training from latest sample");
        let result = self.train(None).await;
        *last_failure = result.as_ref().err().cloned();
        self.implicit_runs.fetch_add(1, Ordering::Release);
        result?;

        self.snapshot()
            .ok_or_else(|| DetectError::InsufficientData("model missing after training".into()))
    }

    /// Classify `records`, or the latest `detect_sample_limit` records when `None`.
    ///
    /// Missing data and an unreachable source produce an empty report with an
    /// explicit status. Only a dimension mismatch, which means the extractor
    /// and the model disagree, is returned as an error.
    pub async fn detect(&self, records: Option<Vec<LogRecord>>) -> Result<DetectionReport, DetectError> {
        self.detect_inner(records, self.config.detect_sample_limit, &LogFilter::default())
            .await
    }

    /// Classify the latest `limit` records matching `filter`.
    pub async fn detect_latest(&self, limit: usize, filter: &LogFilter) -> Result<DetectionReport, DetectError> {
        self.detect_inner(None, limit, filter).await
    }

    async fn detect_inner(
        &self,
        records: Option<Vec<LogRecord>>,
        limit: usize,
        filter: &LogFilter,
    ) -> Result<DetectionReport, DetectError> {
        Metrics::inc(&self.metrics.detect_calls);

        let snapshot = match self.ensure_trained().await {
            Ok(snapshot) => snapshot,
            Err(DetectError::InsufficientData(reason)) => {
                info!(%reason, "No model available, reporting no anomalies");
                return Ok(DetectionReport::empty(DetectionStatus::InsufficientData));
            }
            Err(DetectError::UpstreamUnavailable(reason)) | Err(DetectError::TrainingAborted(reason)) => {
                warn!(%reason, "Model could not be trained, reporting no anomalies");
                return Ok(DetectionReport::empty(DetectionStatus::Unavailable));
            }
            Err(e) => return Err(e),
        };

        let records = match records {
            Some(records) => records,
            None => match self.source.fetch(limit, filter).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Cannot fetch logs for detection");
                    return Ok(DetectionReport {
                        model_version: Some(snapshot.version),
                        threshold: Some(snapshot.threshold()),
                        ..DetectionReport::empty(DetectionStatus::Unavailable)
                    });
                }
            },
        };

        if records.is_empty() {
            return Ok(DetectionReport {
                model_version: Some(snapshot.version),
                threshold: Some(snapshot.threshold()),
                ..DetectionReport::empty(DetectionStatus::NoData)
            });
        }

        let verdicts = snapshot.classify(records)?;
        let report = DetectionReport {
            status: DetectionStatus::Scored,
            model_version: Some(snapshot.version),
            threshold: Some(snapshot.threshold()),
            verdicts,
        };

        let flagged = report.anomaly_count();
        Metrics::add(&self.metrics.anomalies_detected, flagged as u64);
        debug!(version = snapshot.version, total = report.total(), flagged, "Detection complete");
        Ok(report)
    }
}
