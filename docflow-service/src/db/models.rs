//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use super::{parse_optional_timestamp, parse_timestamp};
use crate::pipeline::Stage;

/// Pipeline status of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Uploaded or re-queued, not yet picked up
    Pending,
    Parsing,
    Chunking,
    Embedding,
    Storing,
    /// Every stage succeeded
    Completed,
    /// A stage failed terminally or the document was skipped
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Storing => "storing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => DocumentStatus::Pending,
            "parsing" => DocumentStatus::Parsing,
            "chunking" => DocumentStatus::Chunking,
            "embedding" => DocumentStatus::Embedding,
            "storing" => DocumentStatus::Storing,
            "completed" => DocumentStatus::Completed,
            _ => DocumentStatus::Error,
        }
    }
}

impl From<Stage> for DocumentStatus {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Parsing => DocumentStatus::Parsing,
            Stage::Chunking => DocumentStatus::Chunking,
            Stage::Embedding => DocumentStatus::Embedding,
            Stage::Storing => DocumentStatus::Storing,
        }
    }
}

/// Document status record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    #[serde(skip_serializing)]
    pub filepath: String,
    pub size: u64,
    pub status: DocumentStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    pub chunks_count: u32,
    /// Wall-clock seconds of the last successful run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration: Option<f64>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub(crate) const COLUMNS: &'static str = "id, filename, filepath, size, status, progress, \
         message, total_pages, chunks_count, processing_duration, error_count, last_error, \
         created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let size: i64 = row.get(3)?;
        let status_str: String = row.get(4)?;
        let progress: i64 = row.get(5)?;
        let total_pages: Option<i64> = row.get(7)?;
        let chunks_count: i64 = row.get(8)?;
        let error_count: i64 = row.get(10)?;
        let created_at_str: String = row.get(12)?;
        let updated_at_str: String = row.get(13)?;

        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            filepath: row.get(2)?,
            size: size.max(0) as u64,
            status: DocumentStatus::from_str(&status_str),
            progress: progress.clamp(0, 100) as u8,
            message: row.get(6)?,
            total_pages: total_pages.map(|p| p.max(0) as u32),
            chunks_count: chunks_count.max(0) as u32,
            processing_duration: row.get(9)?,
            error_count: error_count.max(0) as u32,
            last_error: row.get(11)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// Outcome recorded in a processing log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "started" => LogStatus::Started,
            "completed" => LogStatus::Completed,
            _ => LogStatus::Failed,
        }
    }
}

/// One immutable audit entry for a stage transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    #[serde(skip_serializing)]
    pub id: i64,
    #[serde(skip_serializing)]
    pub document_id: String,
    pub stage: String,
    pub status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(3)?;
        let created_at_str: String = row.get(6)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            stage: row.get(2)?,
            status: LogStatus::from_str(&status_str),
            message: row.get(4)?,
            duration: row.get(5)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

/// Aggregate document counts for the stats endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatistics {
    pub total_documents: u64,
    pub completed: u64,
    pub error: u64,
    /// Documents in any of the four stage states
    pub processing: u64,
    pub pending: u64,
    pub total_chunks: u64,
    /// Percentage of documents completed, two decimals
    pub success_rate: f64,
}

/// Lifecycle state of a queued task
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Retry,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Positional and named arguments for a task handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// A unit of deferred work in the durable queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    /// Last lease renewal by the worker holding the claim
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// At most one live task may carry a given key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

/// Raw task row; decoding the JSON columns and status can fail, which
/// a row mapper closure cannot report as a queue error.
pub(crate) struct TaskRow {
    pub id: String,
    pub task_name: String,
    pub args: String,
    pub kwargs: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub heartbeat_at: Option<String>,
    pub unique_key: Option<String>,
}

impl TaskRow {
    pub(crate) const COLUMNS: &'static str = "id, task_name, args, kwargs, status, created_at, \
         started_at, completed_at, retry_count, max_retries, next_retry_at, result, error_message, \
         heartbeat_at, unique_key";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            task_name: row.get(1)?,
            args: row.get(2)?,
            kwargs: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            next_retry_at: row.get(10)?,
            result: row.get(11)?,
            error_message: row.get(12)?,
            heartbeat_at: row.get(13)?,
            unique_key: row.get(14)?,
        })
    }

    pub(crate) fn into_task(self) -> Result<QueuedTask, crate::error::QueueError> {
        use crate::error::QueueError;

        let payload_error = |source| QueueError::Payload {
            task_id: self.id.clone(),
            source,
        };
        let args: Vec<Value> = serde_json::from_str(&self.args).map_err(payload_error)?;
        let kwargs: Map<String, Value> =
            serde_json::from_str(&self.kwargs).map_err(payload_error)?;
        let result: Option<Value> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(payload_error)?;
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|_| QueueError::InvalidStatus {
                status: self.status.clone(),
            })?;

        Ok(QueuedTask {
            id: self.id,
            name: self.task_name,
            payload: TaskPayload { args, kwargs },
            status,
            created_at: parse_timestamp(&self.created_at),
            started_at: parse_optional_timestamp(self.started_at),
            completed_at: parse_optional_timestamp(self.completed_at),
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            next_retry_at: parse_optional_timestamp(self.next_retry_at),
            result,
            error_message: self.error_message,
            heartbeat_at: parse_optional_timestamp(self.heartbeat_at),
            unique_key: self.unique_key,
        })
    }
}

/// Task counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    #[cfg(test)]
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.retry + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Retry => self.retry += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
        }
    }
}

/// A chunk as persisted by the storing stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredChunk {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let chunk_index: i64 = row.get(2)?;
        let created_at_str: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: chunk_index.max(0) as u32,
            title: row.get(3)?,
            content: row.get(4)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}
