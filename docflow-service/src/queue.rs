//! Durable task queue with at-least-once delivery.
//!
//! Tasks live in the `task_queue` table. A task is claimable while it is
//! `pending` or `retry` and its `next_retry_at` is unset or in the past;
//! claiming flips it to `processing` inside one immediate transaction, so
//! concurrent claimers never receive the same task.
//!
//! A claim is identified by the task id plus its `started_at` stamp. The
//! worker holding it renews `heartbeat_at` while the handler runs; once the
//! heartbeat is older than the lease the reaper releases the task, and any
//! late outcome reported under the old claim is discarded.

pub mod reaper;
pub mod worker;

pub use reaper::Reaper;
pub use worker::{HandlerRegistry, ProcessDocumentHandler, spawn_pool};

pub use crate::db::{QueuedTask, TaskPayload, TaskStats, TaskStatus};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::QueueError;
use crate::pipeline::BackoffPolicy;

/// Lease used when none is configured
const DEFAULT_LEASE: Duration = Duration::from_secs(1800);

/// Outcome of a deduplicated enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new task was created
    New(String),
    /// A live task with the same key already existed
    Duplicate(String),
}

impl Enqueued {
    pub fn task_id(&self) -> &str {
        match self {
            Enqueued::New(id) | Enqueued::Duplicate(id) => id,
        }
    }
}

/// Handle to the durable queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<Database>,
    backoff: BackoffPolicy,
    default_max_retries: u32,
    lease: Duration,
}

impl TaskQueue {
    pub fn new(db: Arc<Database>, backoff: BackoffPolicy, default_max_retries: u32) -> Self {
        Self {
            db,
            backoff,
            default_max_retries,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn from_config(db: Arc<Database>, config: &QueueConfig) -> Self {
        Self::new(db, config.retry_backoff(), config.max_retries)
            .with_lease(config.lease_timeout())
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How long a claim survives without a heartbeat
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Enqueue with the default retry budget. Returns the task id.
    pub fn enqueue(&self, name: &str, payload: TaskPayload) -> Result<String, QueueError> {
        self.enqueue_with(name, payload, self.default_max_retries)
    }

    pub fn enqueue_with(
        &self,
        name: &str,
        payload: TaskPayload,
        max_retries: u32,
    ) -> Result<String, QueueError> {
        let task = self.db.insert_task(name, &payload, max_retries)?;
        metrics::counter!("docflow_tasks_enqueued_total").increment(1);
        debug!(task_id = %task.id, task_name = %name, max_retries, "Task enqueued");
        Ok(task.id)
    }

    /// Enqueue unless a `pending`, `retry` or `processing` task already
    /// carries `unique_key`.
    pub fn enqueue_unique(
        &self,
        name: &str,
        payload: TaskPayload,
        unique_key: &str,
    ) -> Result<Enqueued, QueueError> {
        let (task, created) =
            self.db
                .insert_unique_task(name, &payload, self.default_max_retries, unique_key)?;

        if created {
            metrics::counter!("docflow_tasks_enqueued_total").increment(1);
            debug!(task_id = %task.id, task_name = %name, unique_key, "Task enqueued");
            Ok(Enqueued::New(task.id))
        } else {
            debug!(task_id = %task.id, unique_key, "Live task already queued");
            Ok(Enqueued::Duplicate(task.id))
        }
    }

    /// The live task carrying `unique_key`, if any
    pub fn live_task(&self, unique_key: &str) -> Result<Option<QueuedTask>, QueueError> {
        self.db.live_task(unique_key)
    }

    /// Claim the oldest claimable task, if any.
    pub fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        self.db.claim_next_task(Utc::now())
    }

    /// Mark a task completed. A task that no longer exists is ignored.
    pub fn complete(&self, id: &str, result: Option<&Value>) -> Result<(), QueueError> {
        self.finish(id, None, result).map(|_| ())
    }

    /// Complete a task under the claim `task` was dequeued with. Returns
    /// false when that claim has since been released or taken over.
    pub fn complete_claimed(
        &self,
        task: &QueuedTask,
        result: Option<&Value>,
    ) -> Result<bool, QueueError> {
        self.finish(&task.id, task.started_at.as_ref(), result)
    }

    fn finish(
        &self,
        id: &str,
        claimed_at: Option<&DateTime<Utc>>,
        result: Option<&Value>,
    ) -> Result<bool, QueueError> {
        let updated = self.db.complete_task(id, claimed_at, result)?;
        if updated {
            metrics::counter!("docflow_tasks_completed_total").increment(1);
        } else if claimed_at.is_some() {
            warn!(task_id = %id, "Discarding completion from a lost claim");
        } else {
            debug!(task_id = %id, "Completed task no longer exists");
        }
        Ok(updated)
    }

    /// Record a failure. With `allow_retry` and budget left the task moves
    /// to `retry` after `2^retry_count` base delays; otherwise it is
    /// terminally `failed`.
    pub fn fail(
        &self,
        id: &str,
        message: &str,
        allow_retry: bool,
    ) -> Result<Option<QueuedTask>, QueueError> {
        self.record_failure(id, None, message, allow_retry)
    }

    /// Fail a task under the claim `task` was dequeued with. A task whose
    /// claim was lost is returned unchanged.
    pub fn fail_claimed(
        &self,
        task: &QueuedTask,
        message: &str,
        allow_retry: bool,
    ) -> Result<Option<QueuedTask>, QueueError> {
        self.record_failure(&task.id, task.started_at.as_ref(), message, allow_retry)
    }

    fn record_failure(
        &self,
        id: &str,
        claimed_at: Option<&DateTime<Utc>>,
        message: &str,
        allow_retry: bool,
    ) -> Result<Option<QueuedTask>, QueueError> {
        let task = self.db.fail_task(
            id,
            claimed_at,
            message,
            allow_retry,
            &self.backoff,
            Utc::now(),
        )?;

        match &task {
            Some(task) if task.status == TaskStatus::Retry => {
                metrics::counter!("docflow_tasks_failed_total", "terminal" => "false")
                    .increment(1);
                info!(
                    task_id = %id,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    next_retry_at = ?task.next_retry_at,
                    "Task scheduled for retry"
                );
            }
            Some(task) if task.status == TaskStatus::Failed => {
                metrics::counter!("docflow_tasks_failed_total", "terminal" => "true")
                    .increment(1);
                warn!(
                    task_id = %id,
                    retry_count = task.retry_count,
                    error = %message,
                    "Task failed permanently"
                );
            }
            Some(task) => {
                debug!(task_id = %id, status = %task.status, "Failure ignored for task");
            }
            None => {
                debug!(task_id = %id, "Failed task no longer exists");
            }
        }

        Ok(task)
    }

    /// Extend the claim `task` was dequeued with. Returns false once the
    /// claim has been lost.
    pub fn renew_lease(&self, task: &QueuedTask) -> Result<bool, QueueError> {
        let Some(claimed_at) = task.started_at.as_ref() else {
            return Ok(false);
        };
        self.db.renew_lease(&task.id, claimed_at, Utc::now())
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedTask>, QueueError> {
        self.db.get_task(id)
    }

    pub fn stats(&self) -> Result<TaskStats, QueueError> {
        self.db.task_stats()
    }

    /// Delete `completed`/`failed` tasks that finished before `older_than`.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let deleted = self.db.delete_finished_tasks(older_than)?;
        if deleted > 0 {
            info!(deleted, "Cleaned up finished tasks");
        }
        Ok(deleted)
    }

    /// Fail every `processing` task whose heartbeat is older than `lease`,
    /// allowing a retry. Returns the number of tasks released.
    pub fn requeue_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - lease;

        let stale = self.db.stale_tasks(cutoff)?;
        let mut released = 0;
        for (id, claimed_at) in &stale {
            warn!(task_id = %id, "Task lease expired");
            let task = self.record_failure(id, Some(claimed_at), "lease expired", true)?;
            if task.is_some_and(|t| t.status != TaskStatus::Processing) {
                released += 1;
            }
        }

        Ok(released)
    }
}
