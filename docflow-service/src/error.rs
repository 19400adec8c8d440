use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::StageError;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Document {document_id} is already queued as task {task_id}")]
    AlreadyQueued {
        document_id: String,
        task_id: String,
    },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Queue error")]
    Queue(#[from] QueueError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("File storage failed for {path}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Search failed")]
    Search(#[source] StageError),
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },
}

/// Task queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Durable store unavailable")]
    Store(#[source] DatabaseError),

    #[error("Invalid task payload for {task_id}")]
    Payload {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid task status: {status}")]
    InvalidStatus { status: String },
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Store(DatabaseError::Query(e))
    }
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } | ServiceError::TaskNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::AlreadyQueued { .. } => StatusCode::CONFLICT,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Database(_) | ServiceError::Queue(QueueError::Store(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Search(e) if e.retryable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Search(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::TaskNotFound { .. } => "task_not_found",
            ServiceError::AlreadyQueued { .. } => "already_queued",
            ServiceError::Database(_) => "database_error",
            ServiceError::Queue(QueueError::Store(_)) => "queue_store_error",
            ServiceError::Queue(QueueError::Payload { .. }) => "queue_payload_error",
            ServiceError::Queue(QueueError::InvalidStatus { .. }) => "queue_status_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::FileTooLarge { .. } => "file_too_large",
            ServiceError::Storage { .. } => "storage_error",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Search(_) => "search_failed",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and all of its sources as `outer: inner: root`.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
