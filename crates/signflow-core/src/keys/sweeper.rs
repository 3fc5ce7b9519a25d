//! Background purge sweep

use super::{KeyManager, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodically runs [`KeyManager::sweep`]
#[derive(Debug)]
pub struct KeySweeper;

/// Running sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl KeySweeper {
    /// Spawn the sweep loop on the current runtime
    #[must_use]
    pub fn spawn(keys: Arc<KeyManager>, interval: Duration) -> SweeperHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut purged_total = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let SweepReport { purged, orphaned, deferred } = keys.sweep();
                        purged_total += purged.len() as u64;
                        if !orphaned.is_empty() {
                            tracing::warn!(count = orphaned.len(), "dropped purge entries for unknown keys");
                        }
                        if !deferred.is_empty() {
                            tracing::warn!(count = deferred.len(), "purge queue not updated; retrying next tick");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(purged_total, "key sweeper stopped");
            purged_total
        });
        SweeperHandle { shutdown, task }
    }
}

impl SweeperHandle {
    /// Stop the loop and wait for it; returns the number of keys purged
    pub async fn shutdown(self) -> u64 {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("key sweeper already exited");
        }
        match self.task.await {
            Ok(total) => total,
            Err(e) => {
                tracing::error!("key sweeper task failed: {}", e);
                0
            }
        }
    }
}
