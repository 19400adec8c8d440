//! Durable task queue storage.
//!
//! Every read-modify-write runs inside an immediate transaction so that a
//! second process sharing the database file cannot interleave with it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use super::models::{QueuedTask, TaskPayload, TaskRow, TaskStats, TaskStatus};
use super::{Database, parse_timestamp, to_timestamp};
use crate::error::{DatabaseError, QueueError};
use crate::pipeline::BackoffPolicy;

fn select_task(conn: &Connection, id: &str) -> Result<Option<QueuedTask>, QueueError> {
    conn.query_row(
        &format!("SELECT {} FROM task_queue WHERE id = ?1", TaskRow::COLUMNS),
        params![id],
        TaskRow::from_row,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

fn insert_row(
    conn: &Connection,
    name: &str,
    payload: &TaskPayload,
    max_retries: u32,
    unique_key: Option<&str>,
) -> Result<QueuedTask, QueueError> {
    let id = uuid::Uuid::new_v4().to_string();
    let payload_error = |source| QueueError::Payload {
        task_id: id.clone(),
        source,
    };
    let args = serde_json::to_string(&payload.args).map_err(payload_error)?;
    let kwargs = serde_json::to_string(&payload.kwargs).map_err(payload_error)?;

    conn.execute(
        r#"
        INSERT INTO task_queue (id, task_name, args, kwargs, status, created_at, retry_count, max_retries, unique_key)
        VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7)
        "#,
        params![
            id,
            name,
            args,
            kwargs,
            to_timestamp(&Utc::now()),
            max_retries,
            unique_key
        ],
    )?;

    select_task(conn, &id)?.ok_or_else(|| {
        QueueError::Store(DatabaseError::Query(rusqlite::Error::QueryReturnedNoRows))
    })
}

fn select_live_task(conn: &Connection, unique_key: &str) -> Result<Option<QueuedTask>, QueueError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM task_queue WHERE unique_key = ?1 \
             AND status IN ('pending', 'retry', 'processing') \
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
            TaskRow::COLUMNS
        ),
        params![unique_key],
        TaskRow::from_row,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

/// Whether a stored row still belongs to the claim taken at `claimed_at`.
fn holds_claim(status: TaskStatus, started_at: Option<&str>, claimed_at: &DateTime<Utc>) -> bool {
    status == TaskStatus::Processing && started_at == Some(to_timestamp(claimed_at).as_str())
}

impl Database {
    /// Insert a `pending` task
    pub fn insert_task(
        &self,
        name: &str,
        payload: &TaskPayload,
        max_retries: u32,
    ) -> Result<QueuedTask, QueueError> {
        let conn = self.conn();
        insert_row(&conn, name, payload, max_retries, None)
    }

    /// Insert a `pending` task unless a live task already carries
    /// `unique_key`. Returns the live task and whether it was just created.
    pub fn insert_unique_task(
        &self,
        name: &str,
        payload: &TaskPayload,
        max_retries: u32,
        unique_key: &str,
    ) -> Result<(QueuedTask, bool), QueueError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = select_live_task(&tx, unique_key)? {
            tx.commit()?;
            return Ok((existing, false));
        }

        let task = insert_row(&tx, name, payload, max_retries, Some(unique_key))?;
        tx.commit()?;
        Ok((task, true))
    }

    /// The `pending`, `retry` or `processing` task carrying `unique_key`
    pub fn live_task(&self, unique_key: &str) -> Result<Option<QueuedTask>, QueueError> {
        let conn = self.conn();
        select_live_task(&conn, unique_key)
    }

    /// Claim the oldest claimable task and mark it `processing`.
    pub fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_timestamp(&now);

        let candidate: Option<String> = tx
            .query_row(
                r#"
                SELECT id FROM task_queue
                WHERE status IN ('pending', 'retry')
                  AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
                "#,
                params![now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE task_queue SET status = 'processing', started_at = ?1, heartbeat_at = ?1 \
             WHERE id = ?2 AND status IN ('pending', 'retry')",
            params![now, id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        let task = select_task(&tx, &id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Push the heartbeat of the claim taken at `claimed_at` to `now`.
    /// Returns false once the claim has been lost.
    pub fn renew_lease(
        &self,
        id: &str,
        claimed_at: &DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE task_queue SET heartbeat_at = ?1 \
             WHERE id = ?2 AND status = 'processing' AND started_at = ?3",
            params![to_timestamp(&now), id, to_timestamp(claimed_at)],
        )?;

        Ok(updated > 0)
    }

    /// Mark a task completed. With `claimed_at`, only the worker still
    /// holding that claim may complete it. Returns whether a row changed.
    pub fn complete_task(
        &self,
        id: &str,
        claimed_at: Option<&DateTime<Utc>>,
        result: Option<&Value>,
    ) -> Result<bool, QueueError> {
        let result = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| QueueError::Payload {
                task_id: id.to_string(),
                source,
            })?;

        let conn = self.conn();
        let updated = match claimed_at {
            Some(claimed_at) => conn.execute(
                "UPDATE task_queue SET status = 'completed', completed_at = ?1, result = ?2, \
                 next_retry_at = NULL WHERE id = ?3 AND status = 'processing' AND started_at = ?4",
                params![
                    to_timestamp(&Utc::now()),
                    result,
                    id,
                    to_timestamp(claimed_at)
                ],
            )?,
            None => conn.execute(
                "UPDATE task_queue SET status = 'completed', completed_at = ?1, result = ?2, \
                 next_retry_at = NULL WHERE id = ?3",
                params![to_timestamp(&Utc::now()), result, id],
            )?,
        };

        Ok(updated > 0)
    }

    /// Record a failure and either reschedule or terminally fail the task.
    ///
    /// A retry is scheduled `backoff.delay(retry_count)` after `now`, using
    /// the count before it is incremented. Tasks that are already
    /// terminal are left untouched, as is a task whose claim no longer
    /// matches `claimed_at`. Returns the task as stored afterwards, or
    /// `None` if it does not exist.
    pub fn fail_task(
        &self,
        id: &str,
        claimed_at: Option<&DateTime<Utc>>,
        message: &str,
        allow_retry: bool,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, i64, i64, Option<String>)> = tx
            .query_row(
                "SELECT status, retry_count, max_retries, started_at FROM task_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((status, retry_count, max_retries, started_at)) = current else {
            return Ok(None);
        };

        let status = status
            .parse::<TaskStatus>()
            .map_err(|_| QueueError::InvalidStatus { status })?;
        let lost_claim = claimed_at
            .is_some_and(|claimed_at| !holds_claim(status, started_at.as_deref(), claimed_at));
        if status.is_terminal() || lost_claim {
            let task = select_task(&tx, id)?;
            tx.commit()?;
            return Ok(task);
        }

        if allow_retry && retry_count < max_retries {
            let delay = backoff.delay(retry_count.max(0) as u32);
            let next_retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            tx.execute(
                "UPDATE task_queue SET status = 'retry', retry_count = retry_count + 1, \
                 next_retry_at = ?1, error_message = ?2 WHERE id = ?3",
                params![to_timestamp(&next_retry_at), message, id],
            )?;
        } else {
            tx.execute(
                "UPDATE task_queue SET status = 'failed', completed_at = ?1, \
                 next_retry_at = NULL, error_message = ?2 WHERE id = ?3",
                params![to_timestamp(&now), message, id],
            )?;
        }

        let task = select_task(&tx, id)?;
        tx.commit()?;
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<QueuedTask>, QueueError> {
        let conn = self.conn();
        select_task(&conn, id)
    }

    /// Task counts by status
    pub fn task_stats(&self) -> Result<TaskStats, QueueError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM task_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = TaskStats::default();
        for row in rows {
            let (status, count) = row?;
            let status = status
                .parse::<TaskStatus>()
                .map_err(|_| QueueError::InvalidStatus { status })?;
            stats.add(status, count.max(0) as u64);
        }

        Ok(stats)
    }

    /// Delete finished tasks whose terminal timestamp precedes `cutoff`
    pub fn delete_finished_tasks(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM task_queue WHERE status IN ('completed', 'failed') \
             AND completed_at IS NOT NULL AND completed_at < ?1",
            params![to_timestamp(&cutoff)],
        )?;

        Ok(deleted)
    }

    /// `(id, started_at)` of `processing` tasks whose last heartbeat
    /// precedes `cutoff`
    pub fn stale_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, started_at FROM task_queue WHERE status = 'processing' \
             AND started_at IS NOT NULL AND COALESCE(heartbeat_at, started_at) < ?1 \
             ORDER BY started_at ASC",
        )?;
        let stale = stmt
            .query_map(params![to_timestamp(&cutoff)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .map(|row| row.map(|(id, started_at)| (id, parse_timestamp(&started_at))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stale)
    }
}
