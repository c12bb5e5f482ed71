//! Background task that trims the sent cache.

use crate::NotificationQueue;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Handle to a running eviction task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct EvictionTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionTask {
    /// Evict items older than `period` from `queue` every `period`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(queue: Weak<NotificationQueue>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let Some(queue) = queue.upgrade() else {
                            break;
                        };
                        let evicted = queue.evict_expired(period);
                        if evicted > 0 {
                            debug!(evicted, remaining = queue.len(), "Evicted sent notifications");
                        }
                    }
                }
            }

            trace!("Eviction task stopped");
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Signal the task to stop without waiting for it.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.stop();
    }
}
