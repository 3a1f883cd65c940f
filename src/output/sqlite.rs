//! SQLite output sink.
//!
//! One table per site, named after the sanitized site name. The schema
//! evolves in place: fields added to a config later become new TEXT
//! columns, and existing rows keep their prior values. Batches are written
//! inside a single transaction; a failed batch rolls back entirely.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::domain::config::{OutputMode, SiteConfig};
use crate::domain::models::ScrapeRecord;
use crate::output::RecordWriter;

#[derive(Debug)]
pub struct SqliteWriter {
    pool: Option<SqlitePool>,
    table: String,
    site_name: String,
    mode: OutputMode,
    /// (column name, source field name) for the evolved data columns
    data_columns: Vec<(String, String)>,
}

impl SqliteWriter {
    pub fn new() -> Self {
        Self {
            pool: None,
            table: String::new(),
            site_name: String::new(),
            mode: OutputMode::Append,
            data_columns: Vec::new(),
        }
    }

    /// Sanitize a site name into a SQLite identifier: anything outside
    /// `[A-Za-z0-9_]` becomes `_`, and at least one alphanumeric character
    /// must survive.
    fn sanitize_identifier(name: &str) -> Result<String> {
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if !sanitized.chars().any(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!("Invalid site name for SQLite table: {name}");
        }
        Ok(sanitized)
    }

    /// A destination ending in `.db` is the database file itself; anything
    /// else is a directory receiving `<site_name>.db`.
    fn resolve_db_path(destination: &str, site_name: &str) -> PathBuf {
        let dest = Path::new(destination);
        if dest.extension().and_then(|e| e.to_str()) == Some("db") {
            dest.to_path_buf()
        } else {
            dest.join(format!("{site_name}.db"))
        }
    }

    async fn existing_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(pool)
            .await
            .context("Failed to read table schema")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").context("Malformed PRAGMA row"))
            .collect()
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .as_ref()
            .context("Cannot write to a closed SqliteWriter")
    }

    fn value_to_text(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => serde_json::to_string(other).ok(),
        }
    }
}

impl Default for SqliteWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordWriter for SqliteWriter {
    async fn open(&mut self, config: &SiteConfig) -> Result<()> {
        self.site_name = config.site_name.clone();
        self.table = Self::sanitize_identifier(&config.site_name)?;
        self.mode = config.output.mode;

        let db_path = Self::resolve_db_path(&config.output.destination, &config.site_name);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL,
                source_url TEXT NOT NULL,
                scrape_timestamp TEXT NOT NULL
            )",
            self.table
        ))
        .execute(&pool)
        .await
        .context("Failed to create output table")?;

        // Schema evolution: one new TEXT column per field the table does
        // not know yet.
        let existing = Self::existing_columns(&pool, &self.table).await?;
        self.data_columns.clear();
        for field_name in config.selectors.fields.keys() {
            let column = Self::sanitize_identifier(field_name)
                .with_context(|| format!("Invalid field name '{field_name}'"))?;
            if !existing.contains(&column) {
                sqlx::query(&format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT",
                    self.table, column
                ))
                .execute(&pool)
                .await
                .with_context(|| format!("Failed to add column '{column}'"))?;
            }
            self.data_columns.push((column, field_name.clone()));
        }

        log::debug!(
            "Opened sqlite sink for site '{}' at {} (table {})",
            self.site_name,
            db_path.display(),
            self.table
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn write_records(&mut self, records: &[ScrapeRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let pool = self.pool()?.clone();
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        if self.mode == OutputMode::Overwrite {
            sqlx::query(&format!("DELETE FROM {} WHERE site_name = ?", self.table))
                .bind(&self.site_name)
                .execute(&mut *tx)
                .await
                .context("Failed to clear existing rows")?;
        }

        let mut columns = vec!["site_name", "source_url", "scrape_timestamp"];
        columns.extend(self.data_columns.iter().map(|(column, _)| column.as_str()));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders
        );

        for record in records {
            let mut query = sqlx::query(&insert)
                .bind(&record.site_name)
                .bind(&record.source_url)
                .bind(record.timestamp.to_rfc3339());
            for (_, field_name) in &self.data_columns {
                // A field missing from the record inserts as NULL; record
                // fields with no matching column are ignored.
                let text = record.fields.get(field_name).and_then(Self::value_to_text);
                query = query.bind(text);
            }
            query
                .execute(&mut *tx)
                .await
                .context("Failed to insert record batch")?;
        }

        tx.commit().await.context("Failed to commit record batch")?;
        Ok(records.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}
