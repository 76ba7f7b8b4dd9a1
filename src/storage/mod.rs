//! SQLite log store -- schema, queries, sample data.

pub mod schema;

use crate::record::{LogFilter, LogLevel, LogRecord};
use crate::source::{LogSource, SourceError};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Log store backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteLogStore {
    pool: Pool,
}

impl SqliteLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path)?;
        info!(path = %path.display(), "Opened log store");
        Ok(Self { pool })
    }

    /// Private in-memory database. Pool is pinned to one connection so every
    /// caller sees the same data.
    pub fn open_in_memory() -> Result<Self> {
        let pool = R2D2Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        schema::migrate(&*pool.get()?)?;
        Ok(Self { pool })
    }

    pub fn insert(&self, record: &LogRecord) -> Result<()> {
        self.insert_many(std::slice::from_ref(record))?;
        Ok(())
    }

    pub fn insert_many(&self, records: &[LogRecord]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO logs (timestamp, level, message, pipeline) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in records {
                stmt.execute(rusqlite::params![
                    r.timestamp.map(format_ts),
                    r.level.as_str(),
                    r.message,
                    r.pipeline,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = records.len(), "Inserted log records");
        Ok(records.len())
    }

    /// Seed the five demonstration records used by the dashboard and CLI.
    pub fn insert_sample_logs(&self) -> Result<usize> {
        let now = Utc::now();
        let samples = [
            (LogLevel::Error, "Airflow DAG failed due to missing dependencies", "ETL_Job_1"),
            (LogLevel::Info, "Pipeline executed successfully in 120 seconds", "ETL_Job_2"),
            (LogLevel::Warning, "Data quality check: 5% of records have missing values", "ETL_Job_1"),
            (LogLevel::Error, "Connection timeout while accessing data source", "ETL_Job_3"),
            (LogLevel::Info, "Processed 1.2 million records successfully", "ETL_Job_2"),
        ];
        let records: Vec<LogRecord> = samples
            .iter()
            .map(|(level, msg, pipeline)| LogRecord::new(*level, *msg, Some(pipeline)).at(now))
            .collect();
        self.insert_many(&records)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Row counts grouped by normalised level name.
    pub fn count_by_level(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT level, COUNT(*) FROM logs GROUP BY level")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (level, n) = row?;
            *counts.entry(LogLevel::parse(&level).as_str().to_string()).or_insert(0) += n as u64;
        }
        Ok(counts)
    }

    /// Latest records first; rows without a timestamp sort last.
    pub fn query(&self, limit: usize, filter: &LogFilter) -> Result<Vec<LogRecord>> {
        let mut sql = String::from("SELECT timestamp, level, message, pipeline FROM logs WHERE 1=1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(pipeline) = &filter.pipeline {
            sql.push_str(" AND pipeline = ?");
            args.push(Value::Text(pipeline.clone()));
        }
        if let Some(level) = filter.level {
            sql.push_str(" AND UPPER(level) = ?");
            args.push(Value::Text(level.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (ts, level, message, pipeline) = row?;
            out.push(LogRecord {
                timestamp: ts.as_deref().and_then(parse_ts),
                level: LogLevel::parse(&level),
                message: message.unwrap_or_default(),
                pipeline,
            });
        }
        Ok(out)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // fixed width so lexical order matches time order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => {
            // rows written by other tools; the hour feature falls back to 0
            warn!(raw, "Unparseable log timestamp");
            None
        }
    }
}

#[async_trait::async_trait]
impl LogSource for SqliteLogStore {
    async fn fetch(&self, limit: usize, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
        let store = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || store.query(limit, &filter))
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .map_err(|e| SourceError::Unavailable(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_insert_and_query_latest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteLogStore::open(&dir.path().join("nested").join("logs.db")).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        for i in 0..5 {
            store
                .insert(&LogRecord::new(LogLevel::Info, format!("m{}", i), Some("A")).at(base + Duration::minutes(i)))
                .unwrap();
        }

        let got = store.query(3, &LogFilter::default()).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].message, "m4");
        assert_eq!(got[2].message, "m2");
        assert_eq!(got[0].timestamp, Some(base + Duration::minutes(4)));
    }

    #[test]
    fn test_sample_logs_and_level_counts() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        assert_eq!(store.insert_sample_logs().unwrap(), 5);
        assert_eq!(store.count().unwrap(), 5);

        let counts = store.count_by_level().unwrap();
        assert_eq!(counts.get("ERROR"), Some(&2));
        assert_eq!(counts.get("INFO"), Some(&2));
        assert_eq!(counts.get("WARNING"), Some(&1));
    }

    #[test]
    fn test_query_filters() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store.insert_sample_logs().unwrap();

        let filter = LogFilter {
            pipeline: Some("ETL_Job_1".into()),
            level: None,
        };
        assert_eq!(store.query(10, &filter).unwrap().len(), 2);

        let filter = LogFilter {
            pipeline: Some("ETL_Job_1".into()),
            level: Some(LogLevel::Error),
        };
        let got = store.query(10, &filter).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].message.contains("Airflow"));
    }

    #[test]
    fn test_foreign_rows_are_tolerated() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store
            .pool
            .get()
            .unwrap()
            .execute(
                "INSERT INTO logs (timestamp, level, message, pipeline) VALUES ('yesterday', 'warn', 'x', NULL)",
                [],
            )
            .unwrap();

        let got = store.query(10, &LogFilter::default()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, None);
        assert_eq!(got[0].level, LogLevel::Warning);
        assert_eq!(got[0].pipeline, None);
    }

    #[tokio::test]
    async fn test_fetch_as_log_source() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store.insert_sample_logs().unwrap();
        let source: &dyn LogSource = &store;
        let got = source.fetch(100, &LogFilter::default()).await.unwrap();
        assert_eq!(got.len(), 5);
    }
}
