//! Command-line surface.
//!
//! Exit codes: 0 on success; 1 for missing directories, failed sites, or
//! initialization errors; 2 for usage errors (clap reports conflicting
//! flags with the same code).

use clap::{Parser, Subcommand};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use crate::config::loader::{list_config_files, load_config};
use crate::config::validator::validate_config;
use crate::domain::models::RunResult;
use crate::repository::run_history::{RunHistoryStore, DEFAULT_META_DB};
use crate::service::orchestrator::Orchestrator;

/// Configurable Web Scraping Framework
#[derive(Parser, Debug)]
#[command(name = "cwsf", version, about = "Configuration-driven web scraping framework")]
pub struct Cli {
    /// Increase log output to debug level
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress all output except errors and final results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration directory
    #[arg(long, global = true, default_value = "./configs")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file(s) against the schema
    Validate {
        /// Validate all configuration files in the directory
        #[arg(long)]
        all: bool,
        /// Validate a specific site configuration
        #[arg(long)]
        site: Option<String>,
    },
    /// List all discovered configurations and their status
    List,
    /// Process all valid configuration files once
    Run {
        /// Run the scraper for a single specific site
        #[arg(long)]
        site: Option<String>,
        /// Override the base_url for this run
        #[arg(long = "base-url")]
        base_url: Option<String>,
    },
    /// Show last run results per site
    Status {
        /// Show detailed status for a specific site
        #[arg(long)]
        site: Option<String>,
    },
    /// Run continuously, watching the config directory for changes
    Watch {
        /// Override the base_url for this run
        #[arg(long = "base-url")]
        base_url: Option<String>,
    },
}

fn url_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^https?://").expect("static regex is valid"))
}

fn check_config_dir(config_dir: &Path) -> bool {
    if config_dir.is_dir() {
        return true;
    }
    eprintln!(
        "Error: Config directory '{}' does not exist or is not a directory.",
        config_dir.display()
    );
    false
}

/// Build the override map from CLI flags; returns `None` (usage error)
/// when an override does not look like an http(s) URL.
fn build_overrides(base_url: Option<&str>) -> Option<BTreeMap<String, Value>> {
    let mut overrides = BTreeMap::new();
    if let Some(base_url) = base_url {
        if !url_prefix_re().is_match(base_url) {
            eprintln!("Error: --base-url '{base_url}' does not look like a valid URL.");
            return None;
        }
        overrides.insert("base_url".to_string(), Value::String(base_url.to_string()));
    }
    Some(overrides)
}

/// Run the parsed command to completion, returning the process exit code.
pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::Validate { all, site } => run_validate(&cli.config_dir, all, site.as_deref()),
        Command::List => run_list(&cli.config_dir),
        Command::Run { site, base_url } => {
            run_once(&cli.config_dir, site.as_deref(), base_url.as_deref()).await
        }
        Command::Status { site } => run_status(&cli.config_dir, site.as_deref()).await,
        Command::Watch { base_url } => run_watch(&cli.config_dir, base_url.as_deref()).await,
    }
}

fn run_validate(config_dir: &Path, all: bool, site: Option<&str>) -> i32 {
    if !check_config_dir(config_dir) {
        return 1;
    }
    if all == site.is_some() {
        eprintln!("Error: Must specify exactly one of --all or --site <name>");
        return 2;
    }

    let files = list_config_files(config_dir);
    if files.is_empty() {
        println!("No configuration files found in {}", config_dir.display());
        return 0;
    }

    let mut valid_count = 0usize;
    let mut total_count = 0usize;
    for path in files {
        let value = match load_config(&path) {
            Ok(value) => value,
            Err(e) => {
                if all {
                    total_count += 1;
                    println!("x {}", path.display());
                    println!("  - Parse Error: {e}");
                }
                continue;
            }
        };
        let site_name = value
            .get("site_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if let Some(site) = site {
            if site_name != site {
                continue;
            }
        }
        total_count += 1;

        let result = validate_config(&value);
        if result.is_valid {
            valid_count += 1;
            println!("+ {} ({})", site_name, path.display());
        } else {
            println!("x {} ({})", site_name, path.display());
            for error in &result.errors {
                println!("  - Error: {}: {}", error.field_path, error.message);
            }
        }
        for warning in &result.warnings {
            println!("  - Warning: {}: {}", warning.field_path, warning.message);
        }

        if site.is_some() {
            break;
        }
    }

    if site.is_some() {
        if total_count == 0 {
            eprintln!("Error: No configuration found for site '{}'", site.unwrap_or_default());
            return 1;
        }
        if valid_count == 0 {
            return 1;
        }
        return 0;
    }

    println!("\nSummary: {valid_count} of {total_count} configs valid");
    if valid_count < total_count {
        1
    } else {
        0
    }
}

fn run_list(config_dir: &Path) -> i32 {
    if !check_config_dir(config_dir) {
        return 1;
    }
    let files = list_config_files(config_dir);
    if files.is_empty() {
        println!("No configuration files found in {}", config_dir.display());
        return 0;
    }

    let mut rows: Vec<[String; 5]> = Vec::new();
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let row = match load_config(&path) {
            Ok(value) => {
                let site_name = value
                    .get("site_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let status = if validate_config(&value).is_valid {
                    "valid"
                } else {
                    "invalid"
                };
                let schedule = value
                    .get("schedule")
                    .and_then(|s| s.get("every"))
                    .and_then(Value::as_str)
                    .map(|every| format!("every {every}"))
                    .unwrap_or_else(|| "-".to_string());
                let priority = value
                    .get("priority")
                    .and_then(Value::as_i64)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "default".to_string());
                [site_name, file_name, status.to_string(), schedule, priority]
            }
            Err(_) => [
                file_name.clone(),
                file_name,
                "error".to_string(),
                "-".to_string(),
                "-".to_string(),
            ],
        };
        rows.push(row);
    }
    rows.sort_by_key(|row| row[0].to_lowercase());

    print_table(
        &["Site Name", "File", "Status", "Schedule", "Priority"],
        &rows,
    );
    0
}

async fn run_once(config_dir: &Path, site: Option<&str>, base_url: Option<&str>) -> i32 {
    if !check_config_dir(config_dir) {
        return 1;
    }
    let Some(overrides) = build_overrides(base_url) else {
        return 2;
    };

    let mut orchestrator =
        match Orchestrator::new(config_dir, overrides, Path::new(DEFAULT_META_DB)).await {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                eprintln!("Error: {e:#}");
                return 1;
            }
        };

    match orchestrator.run_once(site).await {
        Ok(summary) => {
            if summary.sites_failed > 0 {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

async fn run_status(config_dir: &Path, site: Option<&str>) -> i32 {
    if !check_config_dir(config_dir) {
        return 1;
    }
    let store = match RunHistoryStore::open(Path::new(DEFAULT_META_DB)).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 1;
        }
    };

    match site {
        Some(site) => {
            let history = match store.site_history(site, 5).await {
                Ok(history) => history,
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    return 1;
                }
            };
            if history.is_empty() {
                println!("No run history found for site '{site}'.");
                return 0;
            }
            println!("Status for site: {site}");
            println!("{}", "-".repeat(40));
            for run in history {
                println!("Run at: {}", run.timestamp.to_rfc3339());
                println!("Status: {}", run.status);
                println!("Records: {}", run.records_count);
                println!("Errors: {}", run.error_count);
                if let Some(last_error) = &run.last_error {
                    println!("Last Error: {last_error}");
                }
                println!("{}", "-".repeat(20));
            }
        }
        None => {
            let latest = match store.latest_runs().await {
                Ok(latest) => latest,
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    return 1;
                }
            };
            if latest.is_empty() {
                println!("No run history found. Execute `cwsf run` to begin scraping.");
                return 0;
            }
            let rows: Vec<[String; 5]> = latest.iter().map(run_to_row).collect();
            print_table(
                &["Site Name", "Last Run", "Records", "Status", "Errors"],
                &rows,
            );
        }
    }
    0
}

async fn run_watch(config_dir: &Path, base_url: Option<&str>) -> i32 {
    if !check_config_dir(config_dir) {
        return 1;
    }
    let Some(overrides) = build_overrides(base_url) else {
        return 2;
    };

    let mut orchestrator =
        match Orchestrator::new(config_dir, overrides, Path::new(DEFAULT_META_DB)).await {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                eprintln!("Error: {e:#}");
                return 1;
            }
        };

    let stop = orchestrator.stop_flag();
    let interrupt_seen = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted. Shutting down gracefully...");
            interrupt_seen.store(true, Ordering::Relaxed);
        }
    });

    match orchestrator.run_watch().await {
        Ok(()) => {
            if stop.load(Ordering::Relaxed) {
                // Interrupted runs exit non-zero.
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

fn run_to_row(run: &RunResult) -> [String; 5] {
    [
        run.site_name.clone(),
        run.timestamp.to_rfc3339(),
        run.records_count.to_string(),
        run.status.to_string(),
        run.error_count.to_string(),
    ]
}

fn print_table(headers: &[&str; 5], rows: &[[String; 5]]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{h:<width$}", width = widths[i]))
        .collect();
    println!("{}", header_line.join("  "));
    let divider: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", divider.join("  "));
    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
            .collect();
        println!("{}", cells.join("  "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn base_url_override_requires_http_prefix() {
        assert!(build_overrides(Some("https://example.com")).is_some());
        assert!(build_overrides(Some("HTTP://example.com")).is_some());
        assert!(build_overrides(Some("ftp://example.com")).is_none());
        assert!(build_overrides(Some("example.com")).is_none());
        let empty = build_overrides(None).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        let result = Cli::try_parse_from(["cwsf", "--verbose", "--quiet", "list"]);
        assert!(result.is_err());
        // clap reports usage conflicts with exit code 2.
        assert_eq!(result.unwrap_err().exit_code(), 2);
    }

    #[test]
    fn missing_config_dir_fails_early() {
        assert!(!check_config_dir(Path::new("/definitely/not/a/real/dir")));
    }
}
