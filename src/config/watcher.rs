//! Filesystem watcher for configuration changes.
//!
//! Raw notify events are debounced per path (editors perform multi-step
//! save sequences), then loaded and validated before anything reaches the
//! orchestrator. The watcher retains the last-known-good config per path
//! so an edit that breaks a file never tears down its running job.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::loader::load_config;
use crate::config::validator::{validate_config, ValidationError};
use crate::domain::config::SiteConfig;

/// Default per-path quiet period before a raw event is flushed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// A configuration change, validated where applicable.
#[derive(Debug)]
pub enum ConfigEvent {
    Validated { path: PathBuf, config: SiteConfig },
    Rejected { path: PathBuf, errors: Vec<ValidationError> },
    Removed { path: PathBuf },
}

impl ConfigEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Validated { path, .. } | Self::Rejected { path, .. } | Self::Removed { path } => {
                path
            }
        }
    }
}

/// Raw change kinds after move-splitting; added and modified files take the
/// same load-and-validate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Changed,
    Removed,
}

/// True for files the watcher should react to: YAML suffix, not a dotfile,
/// not an editor temp file.
fn is_config_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with('~') || name.ends_with(".tmp") {
        return false;
    }
    name.ends_with(".yaml") || name.ends_with(".yml")
}

struct PendingEvent {
    kind: RawKind,
    deadline: Instant,
}

/// Per-watcher state owned by the debounce task.
#[derive(Default)]
struct WatchState {
    last_known_good: HashMap<PathBuf, SiteConfig>,
}

impl WatchState {
    /// Turn a flushed raw event into a config event, loading and
    /// validating for added/modified paths. Directories carrying a YAML
    /// suffix produce nothing.
    fn process(&mut self, path: PathBuf, kind: RawKind) -> Option<ConfigEvent> {
        if kind == RawKind::Removed {
            self.last_known_good.remove(&path);
            log::info!("Config removed: {}", path.display());
            return Some(ConfigEvent::Removed { path });
        }

        if path.is_dir() {
            log::warn!(
                "Ignoring directory '{}' which has a YAML extension",
                path.display()
            );
            return None;
        }

        let value = match load_config(&path) {
            Ok(value) => value,
            Err(e) => {
                self.log_rejection(&path, &e.to_string());
                return Some(ConfigEvent::Rejected {
                    path,
                    errors: vec![ValidationError {
                        field_path: String::new(),
                        message: e.to_string(),
                        value: None,
                    }],
                });
            }
        };

        let validation = validate_config(&value);
        if !validation.is_valid {
            self.log_rejection(&path, &validation.error_summary());
            return Some(ConfigEvent::Rejected {
                path,
                errors: validation.errors,
            });
        }

        match SiteConfig::from_value(&value) {
            Ok(config) => {
                log::info!(
                    "Config validated: {} (site '{}')",
                    path.display(),
                    config.site_name
                );
                self.last_known_good.insert(path.clone(), config.clone());
                Some(ConfigEvent::Validated { path, config })
            }
            Err(e) => {
                self.log_rejection(&path, &e.to_string());
                Some(ConfigEvent::Rejected {
                    path,
                    errors: vec![ValidationError {
                        field_path: String::new(),
                        message: e.to_string(),
                        value: None,
                    }],
                })
            }
        }
    }

    fn log_rejection(&self, path: &Path, detail: &str) {
        match self.last_known_good.get(path) {
            Some(previous) => log::warn!(
                "Config '{}' is now invalid; retaining last-known-good job for site '{}'. {}",
                path.display(),
                previous.site_name,
                detail
            ),
            None => log::warn!("Config rejected '{}': {}", path.display(), detail),
        }
    }
}

/// Monitors a directory (non-recursively) for configuration file changes.
pub struct ConfigWatcher {
    watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `directory`, emitting validated events into
    /// `events_tx`. The directory is created if missing.
    pub fn start(
        directory: &Path,
        debounce: Duration,
        events_tx: mpsc::Sender<ConfigEvent>,
    ) -> anyhow::Result<Self> {
        if !directory.exists() {
            std::fs::create_dir_all(directory)?;
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(PathBuf, RawKind)>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Watcher error: {e}");
                        return;
                    }
                };
                for (path, kind) in split_raw_event(&event) {
                    if is_config_file(&path) {
                        let _ = raw_tx.send((path, kind));
                    }
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(debounce_loop(raw_rx, events_tx, debounce));
        log::info!("Started config watcher on {}", directory.display());
        Ok(Self { watcher, task })
    }

    /// Stop the notify observer and the debounce task.
    pub fn stop(self) {
        drop(self.watcher);
        self.task.abort();
        log::info!("Stopped config watcher");
    }
}

/// Map one notify event to (path, kind) pairs; a move is a removal of the
/// source plus an addition of the destination.
fn split_raw_event(event: &Event) -> Vec<(PathBuf, RawKind)> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Changed))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Changed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(src) = event.paths.first() {
                out.push((src.clone(), RawKind::Removed));
            }
            if let Some(dst) = event.paths.get(1) {
                out.push((dst.clone(), RawKind::Changed));
            }
            out
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Changed))
            .collect(),
        _ => Vec::new(),
    }
}

/// Owns the pending-event slots and last-known-good map. A new raw event
/// replaces any pending event for the same path and re-arms its timer;
/// timer expiry flushes the slot downstream.
async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<(PathBuf, RawKind)>,
    events_tx: mpsc::Sender<ConfigEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
    let mut state = WatchState::default();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        tokio::select! {
            raw = raw_rx.recv() => {
                match raw {
                    Some((path, kind)) => {
                        pending.insert(path, PendingEvent {
                            kind,
                            deadline: Instant::now() + debounce,
                        });
                    }
                    None => break,
                }
            }
            _ = sleep_until_or_never(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    if let Some(slot) = pending.remove(&path) {
                        if let Some(event) = state.process(path, slot.kind) {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
