//! Background maintenance for the task queue: releasing claims whose lease
//! expired (a worker died mid-task) and deleting old finished tasks.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TaskQueue;
use crate::config::QueueConfig;

pub struct Reaper {
    queue: TaskQueue,
    lease_timeout: Duration,
    reaper_interval: Duration,
    retention: chrono::Duration,
    cleanup_interval: Duration,
}

impl Reaper {
    pub fn new(queue: TaskQueue, config: &QueueConfig) -> Self {
        Self {
            queue,
            lease_timeout: config.lease_timeout(),
            reaper_interval: config.reaper_interval(),
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// Release every expired claim once. Returns how many were released.
    pub fn reap_expired(&self) -> usize {
        match self.queue.requeue_stale(self.lease_timeout) {
            Ok(count) => {
                if count > 0 {
                    info!(count, "Released tasks with expired leases");
                }
                count
            }
            Err(e) => {
                warn!(error = %crate::error::format_error_chain(&e), "Lease recovery failed");
                0
            }
        }
    }

    /// Delete finished tasks older than the retention window.
    pub fn cleanup(&self) -> usize {
        match self.queue.cleanup(Utc::now() - self.retention) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %crate::error::format_error_chain(&e), "Task cleanup failed");
                0
            }
        }
    }

    /// Run both loops until `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reap = tokio::time::interval(self.reaper_interval);
            let mut clean = tokio::time::interval(self.cleanup_interval);
            reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            clean.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = reap.tick() => {
                        self.reap_expired();
                    }
                    _ = clean.tick() => {
                        self.cleanup();
                    }
                }
            }

            debug!("Reaper stopped");
        })
    }
}
