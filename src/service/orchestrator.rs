//! Orchestration: binds discovery, the queue, the scrape pipeline, run
//! history, and notifications into one-shot or continuous runs.
//!
//! Error lifecycle: each job runs inside a spawned task so a panic or
//! critical error is contained to that job; fetch-level retries and
//! failure contexts are handled further down; failures notify immediately
//! and aggregate into the periodic run summary.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::loader::scan_config_directory;
use crate::config::watcher::{ConfigEvent, ConfigWatcher, DEFAULT_DEBOUNCE};
use crate::domain::config::{GotifyConfig, SiteConfig};
use crate::domain::models::{
    FailureContext, Job, RunResult, RunStatus, RunSummary, ScrapeResult,
};
use crate::error::AppError;
use crate::repository::run_history::RunHistoryStore;
use crate::service::notifier::GotifyNotifier;
use crate::service::queue::PriorityJobQueue;
use crate::service::rate_limiter;
use crate::service::scraper::scrape_site;

/// Continuous mode emits a summary over this window when results exist.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Poll interval of the continuous loop.
const LOOP_IDLE_SLEEP: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    queue: Arc<PriorityJobQueue>,
    config_dir: PathBuf,
    overrides: BTreeMap<String, Value>,
    history: RunHistoryStore,
    file_to_site: HashMap<PathBuf, String>,
    results: Vec<ScrapeResult>,
    summary_gotify: Option<GotifyConfig>,
    stop: Arc<AtomicBool>,
    pub last_run_summary: Option<RunSummary>,
}

impl Orchestrator {
    /// Build an orchestrator. Failure here (an unopenable meta store) is
    /// fatal for the invocation.
    pub async fn new(
        config_dir: &Path,
        overrides: BTreeMap<String, Value>,
        meta_db_path: &Path,
    ) -> Result<Self> {
        let history = RunHistoryStore::open(meta_db_path)
            .await
            .context("Failed to initialize run history store")?;
        Ok(Self {
            queue: Arc::new(PriorityJobQueue::new()),
            config_dir: config_dir.to_path_buf(),
            overrides,
            history,
            file_to_site: HashMap::new(),
            results: Vec::new(),
            summary_gotify: None,
            stop: Arc::new(AtomicBool::new(false)),
            last_run_summary: None,
        })
    }

    /// Handle for requesting shutdown of the continuous loop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn queue(&self) -> &PriorityJobQueue {
        &self.queue
    }

    /// One-shot mode: scan, enqueue, drain, summarize.
    pub async fn run_once(&mut self, site_name: Option<&str>) -> Result<RunSummary> {
        let start = Instant::now();
        let mut configs = scan_config_directory(&self.config_dir, &self.overrides);

        if let Some(site_name) = site_name {
            let matched: Vec<SiteConfig> = configs
                .iter()
                .filter(|c| c.site_name == site_name)
                .cloned()
                .collect();
            if matched.is_empty() {
                let available = configs.iter().map(|c| c.site_name.clone()).collect();
                return Err(AppError::site_not_found(site_name, available).into());
            }
            configs = matched;
        }

        if configs.is_empty() && self.queue.size() == 0 {
            log::warn!("No valid configs discovered in one-shot mode.");
            return Ok(self.emit_summary(start.elapsed().as_secs_f64()).await);
        }

        for config in configs {
            self.queue.enqueue(Job::new(config));
        }

        self.drain_queue().await;
        let summary = self.emit_summary(start.elapsed().as_secs_f64()).await;
        log::info!("One-shot execution complete.");
        Ok(summary)
    }

    /// Continuous mode: startup scan, then live-reload via the watcher.
    /// `CWSF_WATCH_MODE=once` demotes the invocation to one-shot.
    pub async fn run_watch(&mut self) -> Result<()> {
        if std::env::var("CWSF_WATCH_MODE").as_deref() == Ok("once") {
            log::info!("Mode set to 'once' via CWSF_WATCH_MODE environment variable");
            self.run_once(None).await?;
            return Ok(());
        }

        log::info!("Starting in continuous mode");
        let configs = scan_config_directory(&self.config_dir, &self.overrides);
        for config in configs {
            self.queue.enqueue(Job::new(config));
        }

        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);
        let watcher = ConfigWatcher::start(&self.config_dir, DEFAULT_DEBOUNCE, events_tx)?;

        let mut last_summary_emit = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            // Pump validated config events into the queue.
            while let Ok(event) = events_rx.try_recv() {
                self.handle_config_event(event);
            }

            match self.queue.dequeue() {
                Some(job) => self.execute_job(job).await,
                None => tokio::time::sleep(LOOP_IDLE_SLEEP).await,
            }

            if !self.results.is_empty() && last_summary_emit.elapsed() >= SUMMARY_INTERVAL {
                self.emit_summary(last_summary_emit.elapsed().as_secs_f64()).await;
                last_summary_emit = Instant::now();
            }
        }

        watcher.stop();
        rate_limiter::reset_limiters();
        log::info!("Continuous mode stopped");
        Ok(())
    }

    /// React to one validated/rejected/removed config event.
    pub fn handle_config_event(&mut self, event: ConfigEvent) {
        match event {
            ConfigEvent::Validated { path, config } => {
                let site_name = config.site_name.clone();
                self.file_to_site.insert(path.clone(), site_name.clone());
                self.queue.enqueue(Job::new(config));
                log::info!("Queue updated: {} from {}", site_name, path.display());
            }
            ConfigEvent::Removed { path } => match self.file_to_site.remove(&path) {
                Some(site_name) => {
                    self.queue.remove(&site_name);
                    log::info!(
                        "Queue removed: {} (file {} deleted)",
                        site_name,
                        path.display()
                    );
                }
                None => log::debug!(
                    "Removed file {} was not associated with any active site",
                    path.display()
                ),
            },
            ConfigEvent::Rejected { path, .. } => match self.file_to_site.get(&path) {
                // The watcher retained the last-known-good config; the
                // existing job stays as it is.
                Some(site_name) => log::info!(
                    "Config rejected for {}; retaining existing job for {}",
                    path.display(),
                    site_name
                ),
                None => log::info!(
                    "Config rejected for new file {}; no job created",
                    path.display()
                ),
            },
        }
    }

    async fn drain_queue(&mut self) {
        while let Some(job) = self.queue.dequeue() {
            self.execute_job(job).await;
        }
    }

    /// Execute one job with full fault isolation: a panic or critical
    /// error in any phase produces a failed result and the next job
    /// proceeds.
    async fn execute_job(&mut self, job: Job) {
        if self.queue.is_cancelled(&job.job_id) {
            log::info!("Skipping cancelled job: {}", job.job_id);
            self.queue.complete(&job.job_id, false);
            return;
        }
        log::info!("Executing job: {}", job.site_name);

        if self.summary_gotify.is_none() && job.config.gotify.server_url.is_some() {
            self.summary_gotify = Some(job.config.gotify.clone());
        }
        let notifier = GotifyNotifier::new(Some(&job.config.gotify));

        let config = job.config.clone();
        let outcome = tokio::spawn(async move { scrape_site(&config).await }).await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let message =
                    format!("Critical failure in job {}: {e:#}", job.site_name);
                log::error!("{message}");
                let mut failed = ScrapeResult::new(job.site_name.clone());
                failed.errors.push(message.clone());
                failed.failure_contexts.push(FailureContext {
                    site_name: job.site_name.clone(),
                    url: job.config.base_url.clone(),
                    http_status: None,
                    error_type: "CriticalFailure".to_string(),
                    error_message: message,
                    retries_attempted: 0,
                    timestamp: Utc::now(),
                });
                failed
            }
            Err(join_error) => {
                let message = format!(
                    "Critical failure in job {}: scrape task panicked: {join_error}",
                    job.site_name
                );
                log::error!("{message}");
                let mut failed = ScrapeResult::new(job.site_name.clone());
                failed.errors.push(message.clone());
                failed.failure_contexts.push(FailureContext {
                    site_name: job.site_name.clone(),
                    url: job.config.base_url.clone(),
                    http_status: None,
                    error_type: "Panic".to_string(),
                    error_message: message,
                    retries_attempted: 0,
                    timestamp: Utc::now(),
                });
                failed
            }
        };

        let status = if result.errors.is_empty() {
            RunStatus::Success
        } else if result.records.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        if !result.errors.is_empty() {
            log::error!(
                "Job {} completed with {} errors",
                job.site_name,
                result.errors.len()
            );
            if result.failure_contexts.is_empty() {
                // Errors without contexts still notify with what is known.
                notifier
                    .send_error(&FailureContext {
                        site_name: job.site_name.clone(),
                        url: job.config.base_url.clone(),
                        http_status: None,
                        error_type: "ScrapeError".to_string(),
                        error_message: result.errors[0].clone(),
                        retries_attempted: 0,
                        timestamp: Utc::now(),
                    })
                    .await;
            } else {
                for failure in &result.failure_contexts {
                    notifier.send_error(failure).await;
                }
            }
        } else {
            log::info!("Completed job: {} successfully", job.site_name);
        }

        let run_result = RunResult {
            site_name: job.site_name.clone(),
            timestamp: Utc::now(),
            records_count: result.records.len() as i64,
            status,
            error_count: result.errors.len() as i64,
            last_error: result.errors.first().cloned(),
        };
        if let Err(e) = self.history.record_run(&run_result).await {
            log::error!("Failed to record run history for {}: {e:#}", job.site_name);
        }

        self.queue.complete(&job.job_id, status == RunStatus::Success);
        self.results.push(result);
    }

    /// Build, log, and (on failures) push the summary over the
    /// accumulated results, then clear the accumulator.
    async fn emit_summary(&mut self, duration_seconds: f64) -> RunSummary {
        let summary = RunSummary::from_results(&self.results, duration_seconds);

        let mut lines = vec![
            "========== CWSF Run Summary ==========".to_string(),
            format!("Duration:        {:.1}s", summary.duration_seconds),
            format!("Sites Attempted: {}", summary.total_sites),
            format!("Sites Succeeded: {}", summary.sites_succeeded),
            format!("Sites Failed:    {}", summary.sites_failed),
            format!("Total Records:   {}", summary.total_records),
            String::new(),
            "Per-Site Results:".to_string(),
        ];
        for result in &self.results {
            if let Some(first_error) = result.errors.first() {
                lines.push(format!("    x {:<15} - {}", result.site_name, first_error));
            } else {
                lines.push(format!(
                    "    + {:<15} - {} records",
                    result.site_name,
                    result.records.len()
                ));
            }
        }
        lines.push("========================================".to_string());
        log::info!("{}", lines.join("\n"));

        if summary.sites_failed > 0 {
            let notifier = GotifyNotifier::new(self.summary_gotify.as_ref());
            notifier.send_summary(&summary).await;
        }

        self.last_run_summary = Some(summary.clone());
        self.results.clear();
        summary
    }
}
