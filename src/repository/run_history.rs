//! Append-only run history store.
//!
//! Backs the `status` command and the orchestrator's per-job records.
//! Uses runtime SQL over a small SQLite pool; the table is created on
//! open.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::domain::models::{RunResult, RunStatus};

/// Default location of the meta database.
pub const DEFAULT_META_DB: &str = "./output/cwsf_meta.db";

pub struct RunHistoryStore {
    pool: SqlitePool,
}

impl RunHistoryStore {
    /// Open (and create if needed) the history database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create meta directory {}", parent.display())
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .with_context(|| format!("Failed to open run history at {}", db_path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                records_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_count INTEGER NOT NULL,
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create run_history table")?;

        Ok(Self { pool })
    }

    /// Append one run record.
    pub async fn record_run(&self, result: &RunResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_history (site_name, timestamp, records_count, status, error_count, last_error)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.site_name)
        .bind(result.timestamp.to_rfc3339())
        .bind(result.records_count)
        .bind(result.status.as_str())
        .bind(result.error_count)
        .bind(&result.last_error)
        .execute(&self.pool)
        .await
        .context("Failed to record run")?;
        Ok(())
    }

    /// Latest run per site, ordered by site name.
    pub async fn latest_runs(&self) -> Result<Vec<RunResult>> {
        let rows = sqlx::query(
            r#"
            SELECT h1.* FROM run_history h1
            JOIN (
                SELECT site_name, MAX(timestamp) AS max_ts
                FROM run_history
                GROUP BY site_name
            ) h2 ON h1.site_name = h2.site_name AND h1.timestamp = h2.max_ts
            ORDER BY h1.site_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch latest runs")?;
        rows.iter().map(row_to_run_result).collect()
    }

    /// Last `limit` runs for one site, newest first.
    pub async fn site_history(&self, site_name: &str, limit: i64) -> Result<Vec<RunResult>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM run_history
            WHERE site_name = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(site_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch site history")?;
        rows.iter().map(row_to_run_result).collect()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_to_run_result(row: &sqlx::sqlite::SqliteRow) -> Result<RunResult> {
    let timestamp_raw: String = row.try_get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Malformed timestamp '{timestamp_raw}'"))?;
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<RunStatus>()
        .map_err(|_| anyhow::anyhow!("Unknown run status '{status_raw}'"))?;

    Ok(RunResult {
        site_name: row.try_get("site_name")?,
        timestamp,
        records_count: row.try_get("records_count")?,
        status,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
    })
}
