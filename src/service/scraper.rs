//! The per-site scrape pipeline: fetch, parse, transform, emit.
//!
//! Fetch and parse failures are recorded on the `ScrapeResult` and end
//! pagination; sink failures are critical and surface as an error from
//! [`scrape_site`], which the orchestrator's per-job wrapper turns into a
//! failed run without touching other jobs.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::domain::config::SiteConfig;
use crate::domain::models::{ScrapeRecord, ScrapeResult};
use crate::output;
use crate::service::fetcher::{self, SessionClient};
use crate::service::paginator::Paginator;
use crate::service::parser;

/// Default cap on concurrently scraped sites in the batch API.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Scrape one site end to end and persist its records.
///
/// The returned `ScrapeResult` carries per-page errors and failure
/// contexts; an `Err` from this function is a critical failure (session
/// setup or sink trouble).
pub async fn scrape_site(config: &SiteConfig) -> Result<ScrapeResult> {
    let site_name = &config.site_name;
    let mut result = ScrapeResult::new(site_name.clone());

    let mut session = SessionClient::new(config)
        .with_context(|| format!("Failed to build HTTP session for site '{site_name}'"))?;
    fetcher::perform_login(&mut session, config).await;

    let mut paginator = Paginator::new(config);
    let mut current_url = paginator.first_url(&config.base_url);
    let mut pages_fetched: u32 = 0;

    loop {
        let fetch_res = match fetcher::fetch(config, &session, &current_url, &mut result).await {
            Ok(fetch_res) => fetch_res,
            Err(e) => {
                result.errors.push(e.to_string());
                log::error!("Failed to fetch {current_url} for site {site_name}: {e}");
                break;
            }
        };

        pages_fetched += 1;
        result.stats.pages_fetched = pages_fetched;
        result.stats.status_code = Some(fetch_res.status_code);
        result.stats.elapsed_seconds += fetch_res.elapsed.as_secs_f64();

        if fetch_res.status_code >= 400 {
            let error_msg = format!("HTTP {} error for {}", fetch_res.status_code, current_url);
            result.errors.push(error_msg.clone());
            if matches!(fetch_res.status_code, 401 | 403) {
                log::warn!(
                    "Possible session expiration or authorization failure: HTTP {} for {} (site: {})",
                    fetch_res.status_code,
                    current_url,
                    site_name
                );
            } else {
                log::error!("{error_msg} (site: {site_name})");
            }
            break;
        }

        let raw_records = match parser::parse_records(&fetch_res.body, &config.selectors) {
            Ok(raw_records) => raw_records,
            Err(e) => {
                // The page yields no records; the zero-records rule ends
                // pagination below.
                result.errors.push(e.to_string());
                log::error!("Failed to parse {current_url} for site {site_name}: {e}");
                Vec::new()
            }
        };

        let timestamp = Utc::now();
        let page_records = raw_records.len();
        for fields in raw_records {
            result.records.push(ScrapeRecord {
                fields,
                site_name: site_name.clone(),
                source_url: fetch_res.url.clone(),
                timestamp,
            });
        }
        log::info!(
            "Successfully scraped {page_records} records from {current_url} for site {site_name}"
        );

        if paginator.should_stop(pages_fetched, page_records) {
            break;
        }
        match paginator.next_url(&fetch_res, pages_fetched) {
            Some(next) => current_url = next,
            None => break,
        }
    }

    write_records(config, &result).await?;
    Ok(result)
}

/// Persist the scraped records through the configured sink. A sink failure
/// is critical: the batch has rolled back and the job must be reported
/// failed.
async fn write_records(config: &SiteConfig, result: &ScrapeResult) -> Result<()> {
    if result.records.is_empty() {
        return Ok(());
    }
    let mut writer = output::writer_for(config)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("No sink for site '{}'", config.site_name))?;

    writer.open(config).await?;
    let written = match writer.write_records(&result.records).await {
        Ok(written) => written,
        Err(e) => {
            let _ = writer.close().await;
            return Err(e.context(format!(
                "Sink write failed for site '{}'",
                config.site_name
            )));
        }
    };
    writer.close().await?;
    log::info!(
        "Wrote {written} records for site '{}' to {}",
        config.site_name,
        config.output.destination
    );
    Ok(())
}

/// Scrape multiple sites concurrently, capped by a semaphore. Critical
/// failures collapse into failed `ScrapeResult`s so one site cannot sink
/// the batch.
pub async fn run_all(configs: Vec<SiteConfig>, max_concurrency: usize) -> Vec<ScrapeResult> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));

    let tasks: Vec<_> = configs
        .into_iter()
        .map(|config| {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("batch semaphore is never closed");
                let site_name = config.site_name.clone();
                match scrape_site(&config).await {
                    Ok(result) => result,
                    Err(e) => {
                        let mut failed = ScrapeResult::new(site_name.clone());
                        failed.errors.push(format!("Critical failure: {e:#}"));
                        log::error!("Critical failure in site {site_name}: {e:#}");
                        failed
                    }
                }
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(result) => results.push(result),
            Err(e) => {
                let mut failed = ScrapeResult::new("unknown");
                failed.errors.push(format!("Scrape task panicked: {e}"));
                results.push(failed);
            }
        }
    }
    results
}
