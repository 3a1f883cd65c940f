//! Stub webhook sink.
//!
//! Registered to validate the pluggable sink design; writing is not
//! implemented yet.

use async_trait::async_trait;

use crate::domain::config::SiteConfig;
use crate::domain::models::ScrapeRecord;
use crate::output::RecordWriter;

#[derive(Default, Debug)]
pub struct WebhookWriter {
    destination: Option<String>,
}

impl WebhookWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordWriter for WebhookWriter {
    async fn open(&mut self, config: &SiteConfig) -> anyhow::Result<()> {
        self.destination = Some(config.output.destination.clone());
        Ok(())
    }

    async fn write_records(&mut self, _records: &[ScrapeRecord]) -> anyhow::Result<usize> {
        anyhow::bail!("Webhook writer is not yet implemented")
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
