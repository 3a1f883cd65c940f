//! Output sinks: the writer contract and the format registry.

pub mod sqlite;
pub mod webhook;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use thiserror::Error;

use crate::domain::config::SiteConfig;
use crate::domain::models::ScrapeRecord;

/// Raised when a config requests an output format nobody registered.
#[derive(Debug, Error)]
#[error("Unsupported output format: {0}")]
pub struct UnsupportedFormatError(pub String);

/// Contract every output sink implements.
#[async_trait]
pub trait RecordWriter: Send + std::fmt::Debug {
    /// Initialize the writer from the site config's output section.
    async fn open(&mut self, config: &SiteConfig) -> anyhow::Result<()>;

    /// Write a batch of records, returning the count written. The batch is
    /// atomic: on failure nothing from it is persisted.
    async fn write_records(&mut self, records: &[ScrapeRecord]) -> anyhow::Result<usize>;

    /// Flush and release resources.
    async fn close(&mut self) -> anyhow::Result<()>;
}

type WriterFactory = fn() -> Box<dyn RecordWriter>;

fn registry() -> &'static RwLock<HashMap<String, WriterFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, WriterFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, WriterFactory> = HashMap::new();
        map.insert("sqlite".to_string(), || Box::new(sqlite::SqliteWriter::new()));
        map.insert("webhook".to_string(), || {
            Box::new(webhook::WebhookWriter::new())
        });
        RwLock::new(map)
    })
}

/// Register a writer constructor for a format name, replacing any previous
/// registration.
pub fn register_writer(format: &str, factory: WriterFactory) {
    registry()
        .write()
        .expect("writer registry poisoned")
        .insert(format.to_string(), factory);
}

/// Construct the writer for a config's output format.
pub fn writer_for(config: &SiteConfig) -> Result<Box<dyn RecordWriter>, UnsupportedFormatError> {
    let format = config.output.format.as_str();
    let registry = registry().read().expect("writer registry poisoned");
    registry
        .get(format)
        .map(|factory| factory())
        .ok_or_else(|| UnsupportedFormatError(format.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(format: &str) -> SiteConfig {
        SiteConfig::from_value(&json!({
            "version": "1.0",
            "site_name": "s",
            "base_url": "http://example.com",
            "output": {"format": format, "destination": "./output/", "mode": "append"},
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
        }))
        .unwrap()
    }

    #[test]
    fn known_formats_resolve() {
        assert!(writer_for(&config("sqlite")).is_ok());
        assert!(writer_for(&config("webhook")).is_ok());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = writer_for(&config("parquet")).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported output format: parquet");
    }

    #[test]
    fn registry_accepts_new_formats() {
        register_writer("webhook2", || Box::new(webhook::WebhookWriter::new()));
        assert!(writer_for(&config("webhook2")).is_ok());
    }
}
