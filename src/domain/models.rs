//! Runtime domain models: jobs, fetch/scrape results, and run reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::config::SiteConfig;

// ============================================================================
// JOB
// ============================================================================

/// Status of a scraping job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A runnable bound to one validated site configuration.
///
/// `job_id` equals `site_name` and is the key for upsert and removal. A
/// config replacement produces a new `Job` value; the queue installs the
/// replacement and drops the previous one.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub site_name: String,
    pub config: SiteConfig,
    pub priority: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(config: SiteConfig) -> Self {
        let now = Utc::now();
        Self {
            job_id: config.site_name.clone(),
            site_name: config.site_name.clone(),
            priority: config.priority,
            config,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Return a copy with the given status and a fresh `updated_at`.
    pub fn with_status(&self, status: JobStatus) -> Self {
        let mut job = self.clone();
        job.status = status;
        job.updated_at = Utc::now();
        job
    }

    /// Return a copy carrying a replacement config. The job identity and
    /// creation time are preserved; priority follows the new config.
    pub fn with_config(&self, config: SiteConfig) -> Self {
        let mut job = self.clone();
        job.priority = config.priority;
        job.config = config;
        job.updated_at = Utc::now();
        job
    }
}

// ============================================================================
// FETCH / SCRAPE RESULTS
// ============================================================================

/// Outcome of a single page fetch, plain or rendered.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Final URL after redirects
    pub url: String,
    pub status_code: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub elapsed: Duration,
}

/// A single extracted record with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRecord {
    pub fields: BTreeMap<String, Value>,
    pub site_name: String,
    pub source_url: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate fetch statistics for one site scrape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeStats {
    /// Status of the last fetched page
    pub status_code: Option<u16>,
    pub elapsed_seconds: f64,
    pub pages_fetched: u32,
}

/// Result of a full site scrape.
#[derive(Debug, Clone, Default)]
pub struct ScrapeResult {
    pub site_name: String,
    pub records: Vec<ScrapeRecord>,
    pub errors: Vec<String>,
    pub failure_contexts: Vec<FailureContext>,
    pub stats: ScrapeStats,
}

impl ScrapeResult {
    pub fn new(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Context for a failed request after retry exhaustion.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub site_name: String,
    pub url: String,
    pub http_status: Option<u16>,
    pub error_type: String,
    pub error_message: String,
    pub retries_attempted: u32,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// RUN REPORTING
// ============================================================================

/// Terminal status of one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the append-only run history, keyed by (site_name, timestamp).
#[derive(Debug, Clone)]
pub struct RunResult {
    pub site_name: String,
    pub timestamp: DateTime<Utc>,
    pub records_count: i64,
    pub status: RunStatus,
    pub error_count: i64,
    pub last_error: Option<String>,
}

/// Aggregate over one orchestration cycle.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_sites: usize,
    pub sites_succeeded: usize,
    pub sites_failed: usize,
    pub total_records: usize,
    pub total_errors: usize,
    pub duration_seconds: f64,
    /// site_name -> first error, for each failed site
    pub failed_sites: BTreeMap<String, String>,
}

impl RunSummary {
    /// Build a summary over the scrape results of one run window.
    pub fn from_results(results: &[ScrapeResult], duration_seconds: f64) -> Self {
        let total_sites = results.len();
        let sites_succeeded = results.iter().filter(|r| r.succeeded()).count();
        let mut failed_sites = BTreeMap::new();
        for result in results {
            if let Some(first) = result.errors.first() {
                failed_sites.insert(result.site_name.clone(), first.clone());
            }
        }
        Self {
            total_sites,
            sites_succeeded,
            sites_failed: total_sites - sites_succeeded,
            total_records: results.iter().map(|r| r.records.len()).sum(),
            total_errors: results.iter().map(|r| r.errors.len()).sum(),
            duration_seconds,
            failed_sites,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(site: &str, priority: i64) -> SiteConfig {
        SiteConfig::from_value(&json!({
            "version": "1.0",
            "site_name": site,
            "base_url": "http://example.com",
            "priority": priority,
            "selectors": {"fields": {"title": {"selector": "h1", "kind": "css"}}}
        }))
        .unwrap()
    }

    #[test]
    fn job_id_tracks_site_name() {
        let job = Job::new(test_config("books", 5));
        assert_eq!(job.job_id, "books");
        assert_eq!(job.priority, 5);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn with_config_keeps_identity_and_creation_time() {
        let job = Job::new(test_config("books", 5));
        let updated = job.with_config(test_config("books", 1));
        assert_eq!(updated.job_id, "books");
        assert_eq!(updated.priority, 1);
        assert_eq!(updated.created_at, job.created_at);
    }

    #[test]
    fn summary_counts_failures_and_records() {
        let mut ok = ScrapeResult::new("a");
        ok.records.push(ScrapeRecord {
            fields: BTreeMap::new(),
            site_name: "a".into(),
            source_url: "http://example.com".into(),
            timestamp: Utc::now(),
        });
        let mut bad = ScrapeResult::new("b");
        bad.errors.push("HTTP 503 error".into());

        let summary = RunSummary::from_results(&[ok, bad], 1.0);
        assert_eq!(summary.total_sites, 2);
        assert_eq!(summary.sites_succeeded, 1);
        assert_eq!(summary.sites_failed, 1);
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.failed_sites.get("b").unwrap(), "HTTP 503 error");
    }
}
