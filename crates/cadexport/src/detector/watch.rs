//! Watch-mode detection: diff the record set when the database files change.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DetectorContext, StateCache};
use crate::config::DetectorConfig;
use crate::error::DetectorError;

enum WatchSignal {
    Changed,
    Failed(String),
}

/// Rescans the jobs table whenever the database file (or its WAL/journal)
/// is written, and on a fixed interval while file observation is down.
pub struct WatchDetector {
    db_path: Option<PathBuf>,
    ctx: DetectorContext,
    config: DetectorConfig,
    cache: StateCache,
}

impl WatchDetector {
    pub fn new(db_path: Option<PathBuf>, ctx: DetectorContext, config: DetectorConfig) -> Self {
        Self {
            db_path,
            ctx,
            config,
            cache: StateCache::default(),
        }
    }

    /// Loads the current record set as the baseline. Returns its size.
    pub fn prime(&mut self) -> Result<usize, DetectorError> {
        let jobs = self.ctx.store().list(None, self.config.scan_limit, 0)?;
        self.cache.prime(&jobs);
        Ok(jobs.len())
    }

    /// Diffs the record set against the baseline and publishes the
    /// differences. Returns the number of events published.
    pub async fn rescan(&mut self) -> Result<usize, DetectorError> {
        let jobs = self.ctx.store().list(None, self.config.scan_limit, 0)?;
        let events = self.cache.diff(&jobs);
        let count = events.len();
        for event in events {
            self.ctx.publish(event).await;
        }
        Ok(count)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.prime() {
            warn!(error = %e, "Failed to load initial job states");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = match self.db_path.clone() {
            Some(path) => match start_watcher(&path, &self.config, tx.clone()) {
                Ok(debouncer) => {
                    info!(path = %path.display(), "Change detector watching database file");
                    Some(debouncer)
                }
                Err(e) => {
                    warn!(error = %e, "File observation unavailable, falling back to polling");
                    None
                }
            },
            None => {
                info!("In-memory database, change detector polling");
                None
            }
        };
        let mut healthy = watcher.is_some();

        let mut fallback = tokio::time::interval(self.config.fallback_poll());
        fallback.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(WatchSignal::Changed) => {
                        if !healthy && watcher.is_some() {
                            info!("File observation recovered");
                            healthy = true;
                        }
                        self.rescan_logged().await;
                    }
                    Some(WatchSignal::Failed(reason)) => {
                        if healthy {
                            warn!(%reason, "File observation failed, falling back to polling");
                        }
                        healthy = false;
                    }
                    None => healthy = false,
                },
                _ = fallback.tick(), if !healthy => self.rescan_logged().await,
            }
        }

        drop(watcher);
        info!("Change detector stopped");
    }

    async fn rescan_logged(&mut self) {
        match self.rescan().await {
            Ok(0) => {}
            Ok(n) => debug!(events = n, "Published detected changes"),
            Err(e) => warn!(error = %e, "Rescan failed"),
        }
    }
}

/// Names of the files whose modification means the jobs table may have
/// changed. `-shm` is touched by readers too and is left out.
fn relevant_names(db_path: &Path) -> Vec<OsString> {
    let Some(name) = db_path.file_name() else {
        return Vec::new();
    };
    ["", "-wal", "-journal"]
        .iter()
        .map(|suffix| {
            let mut n = name.to_os_string();
            n.push(suffix);
            n
        })
        .collect()
}

fn start_watcher(
    db_path: &Path,
    config: &DetectorConfig,
    tx: mpsc::UnboundedSender<WatchSignal>,
) -> Result<Debouncer<RecommendedWatcher>, DetectorError> {
    let dir = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let names = relevant_names(db_path);

    let mut debouncer = new_debouncer(config.watch_debounce(), move |result: DebounceEventResult| {
        let signal = match result {
            Ok(events) => {
                let touched = events.iter().any(|event| {
                    event
                        .path
                        .file_name()
                        .is_some_and(|n| names.iter().any(|want| want == n))
                });
                if !touched {
                    return;
                }
                WatchSignal::Changed
            }
            Err(e) => WatchSignal::Failed(e.to_string()),
        };
        let _ = tx.send(signal);
    })
    .map_err(|e| DetectorError::Watch(e.to_string()))?;

    debouncer
        .watcher()
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| DetectorError::Watch(e.to_string()))?;

    Ok(debouncer)
}
