//! Deterministic feature extraction from log records.

use crate::record::LogRecord;
use chrono::Timelike;

/// Number of features per record.
pub const DIMENSION: usize = 3;

/// Number of categorical buckets for the pipeline identifier.
pub const PIPELINE_BUCKETS: u32 = 10;

const UNKNOWN_PIPELINE: &str = "unknown";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// `(level_rank, pipeline_bucket, hour_of_day)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; DIMENSION]);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn level_rank(&self) -> f64 {
        self.0[0]
    }

    pub fn pipeline_bucket(&self) -> f64 {
        self.0[1]
    }

    pub fn hour_of_day(&self) -> f64 {
        self.0[2]
    }
}

impl AsRef<[f64]> for FeatureVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// 32-bit FNV-1a over the UTF-8 bytes of `s`.
///
/// Fixed so that bucket assignment is identical across restarts and across
/// implementations in other languages.
pub fn fnv1a_32(s: &str) -> u32 {
    s.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

pub fn pipeline_bucket(pipeline: Option<&str>) -> u32 {
    fnv1a_32(pipeline.unwrap_or(UNKNOWN_PIPELINE)) % PIPELINE_BUCKETS
}

/// Map a record to its feature vector. Total and side-effect free.
pub fn extract(record: &LogRecord) -> FeatureVector {
    let level = f64::from(record.level.rank());
    let bucket = f64::from(pipeline_bucket(record.pipeline.as_deref()));
    let hour = record.timestamp.map(|t| t.hour()).unwrap_or(0);
    FeatureVector([level, bucket, f64::from(hour)])
}

pub fn extract_all(records: &[LogRecord]) -> Vec<FeatureVector> {
    records.iter().map(extract).collect()
}
