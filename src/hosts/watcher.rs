//! Reloads the hosts table when its source file changes.
//!
//! The file's modification time and length are polled on a fixed interval;
//! any change triggers a reload. Read failures keep the previous table.
//!
//! Polling trades latency for portability: a change is seen up to one
//! interval late, and an edit that keeps the file length within the
//! filesystem's mtime granularity goes unnoticed until the next change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Overrides;

/// What we compare between polls to detect a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

/// Watches the hosts file and swaps in a new table on change.
pub struct HostsWatcher {
    path: PathBuf,
    overrides: Arc<Overrides>,
    interval: Duration,
    last: Option<Fingerprint>,
}

impl HostsWatcher {
    /// Create a watcher. The file's current state is taken as already loaded.
    pub fn new(path: impl Into<PathBuf>, overrides: Arc<Overrides>, interval: Duration) -> Self {
        let path = path.into();
        let last = std::fs::metadata(&path).ok().map(|m| Fingerprint::of(&m));

        Self {
            path,
            overrides,
            interval,
            last,
        }
    }

    /// Start polling on the current `LocalSet`.
    pub fn start(self) {
        tokio::task::spawn_local(self.run());
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip first immediate tick

        loop {
            interval.tick().await;
            self.poll().await;
        }
    }

    /// Check the file once, reloading if it changed.
    ///
    /// Returns `true` if a new table was installed.
    pub async fn poll(&mut self) -> bool {
        let current = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Fingerprint::of(&metadata),
            Err(e) => {
                if self.last.take().is_some() {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "hosts file unavailable, keeping previous table"
                    );
                }
                return false;
            }
        };

        if self.last == Some(current) {
            return false;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(source) => {
                let entries = self.overrides.reload(&source);
                self.last = Some(current);
                info!(path = %self.path.display(), entries, "reloaded hosts overrides");
                true
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to reload hosts file, keeping previous table"
                );
                debug!(?current, "will retry on next poll");
                false
            }
        }
    }
}
