//! Log source contract and an in-process implementation.

use crate::record::{LogFilter, LogRecord};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("log source unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to stored pipeline logs.
///
/// Implementations return at most `limit` records matching `filter`, most
/// recent first. They may be slow and may return nothing.
#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, limit: usize, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError>;
}

/// Log source backed by a vector. Records are kept in insertion order and
/// served newest-inserted first.
#[derive(Default)]
pub struct MemoryLogSource {
    records: RwLock<Vec<LogRecord>>,
    down: AtomicBool,
}

impl MemoryLogSource {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            down: AtomicBool::new(false),
        }
    }

    pub fn push(&self, record: LogRecord) {
        self.records.write().push(record);
    }

    /// Swap the whole backing set.
    pub fn replace(&self, records: Vec<LogRecord>) {
        *self.records.write() = records;
    }

    /// Simulate an outage: every fetch fails until switched back.
    pub fn set_unavailable(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl LogSource for MemoryLogSource {
    async fn fetch(&self, limit: usize, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source switched off".into()));
        }
        let records = self.records.read();
        Ok(records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;

    #[test]
    fn test_memory_source_newest_first_and_limit() {
        let src = MemoryLogSource::default();
        for i in 0..5 {
            src.push(LogRecord::new(LogLevel::Info, format!("m{}", i), Some("A")));
        }
        let got = tokio_test::block_on(src.fetch(2, &LogFilter::default())).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message, "m4");
        assert_eq!(got[1].message, "m3");
    }

    #[test]
    fn test_memory_source_filter_and_outage() {
        let src = MemoryLogSource::new(vec![
            LogRecord::new(LogLevel::Error, "e", Some("A")),
            LogRecord::new(LogLevel::Info, "i", Some("B")),
        ]);
        let filter = LogFilter { pipeline: Some("B".into()), level: None };
        let got = tokio_test::block_on(src.fetch(10, &filter)).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, "i");

        src.set_unavailable(true);
        assert!(tokio_test::block_on(src.fetch(10, &filter)).is_err());
    }
}
