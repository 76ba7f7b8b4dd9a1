//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY,
            timestamp TEXT,
            level TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            pipeline TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
    )?;

    // Older databases predate the pipeline filter index.
    let has_pipeline_idx: i32 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='index' AND name='idx_logs_pipeline'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_pipeline_idx == 0 {
        conn.execute("CREATE INDEX idx_logs_pipeline ON logs(pipeline)", [])?;
        conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (2)", [])?;
    }

    Ok(())
}
