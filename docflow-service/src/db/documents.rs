//! Document status record operations.
//!
//! The upload path creates records; after that the orchestrator is the
//! only writer of status, progress, and result columns.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::models::{DocumentRecord, DocumentStatus, ProcessingStatistics};
use super::{Database, to_timestamp};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

impl Database {
    /// Insert a new `pending` document record
    pub fn create_document(
        &self,
        filename: &str,
        filepath: &str,
        size: u64,
    ) -> ServiceResult<DocumentRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = to_timestamp(&Utc::now());

        {
            let conn = self.conn();
            conn.execute(
                r#"
                INSERT INTO documents (id, filename, filepath, size, status, progress, message, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', 0, 'Waiting to be processed', ?5, ?5)
                "#,
                params![id, filename, filepath, size as i64, now],
            )
            .map_err(DatabaseError::Query)?;
        }

        self.get_document(&id)?
            .ok_or(ServiceError::DocumentNotFound { document_id: id })
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<DocumentRecord>> {
        let conn = self.conn();

        let doc = conn
            .query_row(
                &format!(
                    "SELECT {} FROM documents WHERE id = ?1",
                    DocumentRecord::COLUMNS
                ),
                params![id],
                DocumentRecord::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(doc)
    }

    /// List all documents, newest first
    pub fn list_documents(&self) -> ServiceResult<Vec<DocumentRecord>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents ORDER BY created_at DESC, rowid DESC",
                DocumentRecord::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let docs = stmt
            .query_map([], DocumentRecord::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(docs)
    }

    /// List documents in one status, oldest first
    pub fn list_documents_by_status(
        &self,
        status: DocumentStatus,
    ) -> ServiceResult<Vec<DocumentRecord>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
                DocumentRecord::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let docs = stmt
            .query_map(params![status.as_str()], DocumentRecord::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(docs)
    }

    /// Delete a document; logs, chunks, and embeddings cascade.
    /// Returns false if the document did not exist.
    pub fn delete_document(&self, id: &str) -> ServiceResult<bool> {
        let conn = self.conn();

        let deleted = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(deleted > 0)
    }

    /// Move a document to `status` with the given progress and message.
    ///
    /// Entering `error` also increments `error_count` and stores the
    /// message as `last_error`.
    pub fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        progress: u8,
        message: &str,
    ) -> ServiceResult<()> {
        let conn = self.conn();
        let now = to_timestamp(&Utc::now());

        let updated = if status == DocumentStatus::Error {
            conn.execute(
                r#"
                UPDATE documents
                SET status = ?1, progress = ?2, message = ?3, updated_at = ?4,
                    error_count = error_count + 1, last_error = ?3
                WHERE id = ?5
                "#,
                params![status.as_str(), progress, message, now, id],
            )
        } else {
            conn.execute(
                "UPDATE documents SET status = ?1, progress = ?2, message = ?3, updated_at = ?4 WHERE id = ?5",
                params![status.as_str(), progress, message, now, id],
            )
        }
        .map_err(DatabaseError::Query)?;

        if updated == 0 {
            return Err(ServiceError::DocumentNotFound {
                document_id: id.to_string(),
            });
        }

        Ok(())
    }

    /// Record stage results. Only positive values overwrite stored ones.
    pub fn update_document_results(
        &self,
        id: &str,
        total_pages: Option<u32>,
        chunks_count: Option<u32>,
    ) -> ServiceResult<()> {
        let conn = self.conn();

        conn.execute(
            r#"
            UPDATE documents
            SET total_pages = CASE WHEN ?1 > 0 THEN ?1 ELSE total_pages END,
                chunks_count = CASE WHEN ?2 > 0 THEN ?2 ELSE chunks_count END,
                updated_at = ?3
            WHERE id = ?4
            "#,
            params![total_pages, chunks_count, to_timestamp(&Utc::now()), id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn set_processing_duration(&self, id: &str, seconds: f64) -> ServiceResult<()> {
        let conn = self.conn();

        conn.execute(
            "UPDATE documents SET processing_duration = ?1 WHERE id = ?2",
            params![seconds, id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Document counts by status, total chunks, and success rate
    pub fn processing_statistics(&self) -> ServiceResult<ProcessingStatistics> {
        let conn = self.conn();

        let mut stats = ProcessingStatistics::default();
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(chunks_count), 0) FROM documents GROUP BY status",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(DatabaseError::Query)?;

        for row in rows {
            let (status, count, chunks) = row.map_err(DatabaseError::Query)?;
            let count = count.max(0) as u64;
            stats.total_documents += count;
            stats.total_chunks += chunks.max(0) as u64;
            match DocumentStatus::from_str(&status) {
                DocumentStatus::Pending => stats.pending += count,
                DocumentStatus::Completed => stats.completed += count,
                DocumentStatus::Error => stats.error += count,
                _ => stats.processing += count,
            }
        }

        let rate = stats.completed as f64 / stats.total_documents.max(1) as f64 * 100.0;
        stats.success_rate = (rate * 100.0).round() / 100.0;

        Ok(stats)
    }
}
