//! Periodic refill driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::worker::Worker;

/// Default period between refill passes.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Calls [`Worker::refill`] on a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct RefillScheduler {
    period: Duration,
}

impl Default for RefillScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl RefillScheduler {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Start ticking until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The task resolves to the number of refill passes it ran.
    pub fn spawn(self, worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;

            info!(worker = %worker.id(), period = ?self.period, "Refill scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = worker.refill();
                        ticks += 1;
                        if report.refilled > 0 || report.failed > 0 {
                            debug!(worker = %worker.id(), ?report, "Refill tick");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(worker = %worker.id(), ticks, "Refill scheduler stopped");
            ticks
        })
    }
}
