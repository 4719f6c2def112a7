//! Router and handler directory watcher for cache invalidation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A change under one of the watched directories.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub paths: Vec<PathBuf>,
}

/// A watcher that monitors router and handler directories for changes.
pub struct ReloadWatcher {
    dirs: Vec<PathBuf>,
    update_tx: mpsc::UnboundedSender<ReloadEvent>,
}

impl ReloadWatcher {
    /// Create a new ReloadWatcher.
    ///
    /// Returns the watcher and a receiver for change notifications.
    pub fn new(dirs: &[&Path]) -> (Self, mpsc::UnboundedReceiver<ReloadEvent>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                dirs: dirs.iter().map(|d| d.to_path_buf()).collect(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching in a background thread.
    ///
    /// The returned watcher must be kept alive for notifications to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        tracing::debug!(paths = ?event.paths, "Router files changed");
                        let _ = tx.send(ReloadEvent { paths: event.paths });
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for dir in &self.dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            tracing::info!(path = ?dir, "Reload watcher started");
        }
        Ok(watcher)
    }
}
