//! Pipeline log records as read from the log store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
    /// Any level string the store holds that we do not recognise.
    Unknown,
}

impl LogLevel {
    /// Ordinal used as a model feature. Unknown levels rank with INFO.
    pub fn rank(self) -> u8 {
        match self {
            LogLevel::Info | LogLevel::Unknown => 0,
            LogLevel::Warning => 1,
            LogLevel::Error => 2,
            LogLevel::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Unknown => "UNKNOWN",
        }
    }

    /// Parse a stored level string. Never fails.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => LogLevel::Info,
            "WARNING" | "WARN" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            "CRITICAL" => LogLevel::Critical,
            _ => LogLevel::Unknown,
        }
    }

    pub const KNOWN: [LogLevel; 4] = [
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LogLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(LogLevel::parse(&raw))
    }
}

/// A single pipeline event. Immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    /// `None` means the producing pipeline is unknown.
    #[serde(default)]
    pub pipeline: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>, pipeline: Option<&str>) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            level,
            message: message.into(),
            pipeline: pipeline.map(str::to_string),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Query filter understood by every log source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    pub pipeline: Option<String>,
    pub level: Option<LogLevel>,
}

impl LogFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(p) = &self.pipeline {
            if record.pipeline.as_deref() != Some(p.as_str()) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if record.level != level {
                return false;
            }
        }
        true
    }
}
