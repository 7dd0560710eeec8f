//! Background Maintenance
//! Mission: Run periodic housekeeping until shutdown is signalled
//!
//! Tasks are owned handles: each one listens on a broadcast shutdown channel
//! and exits its loop when the channel fires or closes.

use crate::workflow::ApprovalWorkflow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// A named job run on a fixed interval.
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self { name, interval }
    }

    /// Spawn the loop. The first run happens one interval after start.
    pub fn spawn<F>(self, mut shutdown: broadcast::Receiver<()>, mut job: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; skip that tick.
            ticker.tick().await;

            info!(task = self.name, interval_secs = self.interval.as_secs(), "Periodic task started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => job(),
                    _ = shutdown.recv() => {
                        info!(task = self.name, "Periodic task stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// Purge expired replay entries, idempotency records and idle rate windows.
pub fn spawn_sweeper(
    workflow: Arc<ApprovalWorkflow>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    PeriodicTask::new("sweeper", interval).spawn(shutdown, move || match workflow.sweep() {
        Ok(report) => debug!(
            replay_entries = report.replay_entries,
            idempotency_records = report.idempotency_records,
            rate_windows = report.rate_windows,
            "Sweep complete"
        ),
        Err(e) => error!("Sweep failed: {}", e),
    })
}
