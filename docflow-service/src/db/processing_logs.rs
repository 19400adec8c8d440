//! Append-only processing audit log.

use chrono::Utc;
use rusqlite::params;

use super::models::{LogStatus, ProcessingLogEntry};
use super::{Database, to_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Append a stage log entry. `duration` is in seconds.
    pub fn append_processing_log(
        &self,
        document_id: &str,
        stage: &str,
        status: LogStatus,
        message: Option<&str>,
        duration: Option<f64>,
    ) -> ServiceResult<()> {
        let conn = self.conn();

        conn.execute(
            r#"
            INSERT INTO processing_logs (document_id, stage, status, message, duration, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                document_id,
                stage,
                status.as_str(),
                message,
                duration,
                to_timestamp(&Utc::now()),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// All log entries for a document, oldest first
    pub fn get_processing_logs(&self, document_id: &str) -> ServiceResult<Vec<ProcessingLogEntry>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, stage, status, message, duration, created_at \
                 FROM processing_logs WHERE document_id = ?1 ORDER BY created_at ASC, id ASC",
            )
            .map_err(DatabaseError::Query)?;

        let entries = stmt
            .query_map(params![document_id], ProcessingLogEntry::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(entries)
    }
}
