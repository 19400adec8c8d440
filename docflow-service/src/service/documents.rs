//! Document upload, lookup, deletion, and (re)queueing.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use super::DocflowService;
use crate::db::{DocumentRecord, DocumentStatus, ProcessingLogEntry, ProcessingStatistics};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::ErrorSummary;
use crate::queue::worker::PROCESS_DOCUMENT;
use crate::queue::{Enqueued, QueuedTask, TaskPayload, TaskStats};

/// Message stored on a document when it is put back in the queue
const QUEUED_MESSAGE: &str = "Queued for processing";

/// Result of accepting one uploaded file
#[derive(Debug, Clone, Serialize)]
pub struct UploadedDocument {
    pub id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedDocument {
    pub document_id: String,
    pub task_id: String,
}

/// Combined view for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub documents: ProcessingStatistics,
    pub queue: TaskStats,
    pub errors: ErrorSummary,
}

/// Dedup key shared by every pipeline task of one document
fn document_task_key(document_id: &str) -> String {
    format!("document:{document_id}")
}

/// Reduce a client-supplied name to a safe single path component
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

impl DocflowService {
    /// Save an upload, record it as `pending`, and enqueue its pipeline run.
    pub async fn upload_document(
        &self,
        content: &[u8],
        filename: &str,
    ) -> ServiceResult<UploadedDocument> {
        let max = self.config.storage.max_upload_bytes;
        if content.len() as u64 > max {
            return Err(ServiceError::FileTooLarge {
                size: content.len() as u64,
                max,
            });
        }

        let filename = sanitize_filename(filename);
        let upload_dir = self.config.storage.upload_dir();
        tokio::fs::create_dir_all(&upload_dir)
            .await
            .map_err(|e| ServiceError::Storage {
                path: upload_dir.display().to_string(),
                source: e,
            })?;

        let stored_path = upload_dir.join(format!("{}_{}", uuid::Uuid::new_v4(), filename));
        tokio::fs::write(&stored_path, content)
            .await
            .map_err(|e| ServiceError::Storage {
                path: stored_path.display().to_string(),
                source: e,
            })?;

        let document = self.db.create_document(
            &filename,
            &stored_path.to_string_lossy(),
            content.len() as u64,
        )?;
        let task_id = self.enqueue_document(&document.id)?.task_id().to_string();

        info!(
            doc_id = %document.id,
            filename = %document.filename,
            size = document.size,
            task_id = %task_id,
            "Document uploaded"
        );

        Ok(UploadedDocument {
            id: document.id,
            filename: document.filename,
            status: document.status,
            task_id,
        })
    }

    pub fn list_documents(&self) -> ServiceResult<Vec<DocumentRecord>> {
        self.db.list_documents()
    }

    pub fn get_document(&self, document_id: &str) -> ServiceResult<DocumentRecord> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    pub fn document_logs(&self, document_id: &str) -> ServiceResult<Vec<ProcessingLogEntry>> {
        self.get_document(document_id)?;
        self.db.get_processing_logs(document_id)
    }

    /// Delete a document, its stored file, and its failure history.
    pub async fn delete_document(&self, document_id: &str) -> ServiceResult<()> {
        let document = self.get_document(document_id)?;
        self.db.delete_document(document_id)?;
        self.tracker.clear(document_id);

        match tokio::fs::remove_file(&document.filepath).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(doc_id = %document_id, path = %document.filepath, error = %e, "Failed to remove stored file");
            }
        }

        info!(doc_id = %document_id, "Document deleted");
        Ok(())
    }

    /// Reset a document to `pending` and enqueue a fresh pipeline run.
    ///
    /// An explicit request also clears the document's failure count so a
    /// circuit-broken document can be retried. A document whose previous
    /// run is still queued or running is left alone.
    pub fn queue_document(&self, document_id: &str) -> ServiceResult<QueuedDocument> {
        self.get_document(document_id)?;
        let already_queued = |task_id: String| ServiceError::AlreadyQueued {
            document_id: document_id.to_string(),
            task_id,
        };

        if let Some(live) = self.queue.live_task(&document_task_key(document_id))? {
            return Err(already_queued(live.id));
        }

        self.tracker.clear(document_id);
        self.db
            .update_document_status(document_id, DocumentStatus::Pending, 0, QUEUED_MESSAGE)?;

        let task_id = match self.enqueue_document(document_id)? {
            Enqueued::New(task_id) => task_id,
            Enqueued::Duplicate(task_id) => return Err(already_queued(task_id)),
        };
        info!(doc_id = %document_id, task_id = %task_id, "Document queued for processing");

        Ok(QueuedDocument {
            document_id: document_id.to_string(),
            task_id,
        })
    }

    /// Enqueue every `pending` document that has no live task.
    pub fn queue_pending_documents(&self) -> ServiceResult<Vec<QueuedDocument>> {
        let pending = self.db.list_documents_by_status(DocumentStatus::Pending)?;

        let mut queued = Vec::new();
        for document in pending {
            match self.enqueue_document(&document.id)? {
                Enqueued::New(task_id) => queued.push(QueuedDocument {
                    document_id: document.id,
                    task_id,
                }),
                Enqueued::Duplicate(task_id) => {
                    debug!(doc_id = %document.id, task_id = %task_id, "Document already queued");
                }
            }
        }

        if !queued.is_empty() {
            info!(count = queued.len(), "Queued pending documents");
        }
        Ok(queued)
    }

    pub fn get_task(&self, task_id: &str) -> ServiceResult<QueuedTask> {
        self.queue
            .get(task_id)?
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    pub fn stats(&self) -> ServiceResult<ServiceStats> {
        Ok(ServiceStats {
            documents: self.db.processing_statistics()?,
            queue: self.queue.stats()?,
            errors: self.tracker.summary(),
        })
    }

    fn enqueue_document(&self, document_id: &str) -> ServiceResult<Enqueued> {
        let payload = TaskPayload::new().kwarg("document_id", document_id);
        Ok(self
            .queue
            .enqueue_unique(PROCESS_DOCUMENT, payload, &document_task_key(document_id))?)
    }
}
