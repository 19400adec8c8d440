//! Document API endpoints.
//!
//! Upload, listing, inspection, deletion, and requests to (re)run the
//! pipeline.

use axum::{
    Json,
    extract::{Multipart, Path, State},
};
use serde::Serialize;
use std::sync::Arc;

use crate::db::{DocumentRecord, ProcessingLogEntry, StoredChunk};
use crate::error::ServiceError;
use crate::service::{QueuedDocument, UploadedDocument};

use super::AppState;

/// Response for delete operations
#[derive(Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

/// Response for the bulk processing request
#[derive(Serialize)]
pub struct ProcessAllResponse {
    pub queued: usize,
    pub documents: Vec<QueuedDocument>,
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidRequest {
        message: message.into(),
    }
}

/// Upload one or more files from `file` multipart fields
pub async fn upload_documents_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Vec<UploadedDocument>>, ServiceError> {
    let mut uploaded = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("document").to_string();
        let data = field.bytes().await.map_err(|e| invalid(e.body_text()))?;
        uploaded.push(state.service.upload_document(&data, &filename).await?);
    }

    if uploaded.is_empty() {
        return Err(invalid("No file provided"));
    }

    Ok(Json(uploaded))
}

/// List all documents, newest first
pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DocumentRecord>>, ServiceError> {
    Ok(Json(state.service.list_documents()?))
}

pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentRecord>, ServiceError> {
    Ok(Json(state.service.get_document(&id)?))
}

/// Stage log for one document, oldest first
pub async fn document_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ProcessingLogEntry>>, ServiceError> {
    Ok(Json(state.service.document_logs(&id)?))
}

/// Chunks stored for one document, in index order
pub async fn document_chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StoredChunk>>, ServiceError> {
    Ok(Json(state.service.document_chunks(&id)?))
}

pub async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ServiceError> {
    state.service.delete_document(&id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: "Document deleted".to_string(),
    }))
}

/// Reset a document to pending and enqueue it. 409 while a run is
/// already queued or in flight.
pub async fn process_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QueuedDocument>, ServiceError> {
    Ok(Json(state.service.queue_document(&id)?))
}

/// Enqueue every pending document without a live task
pub async fn process_all_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProcessAllResponse>, ServiceError> {
    let documents = state.service.queue_pending_documents()?;
    Ok(Json(ProcessAllResponse {
        queued: documents.len(),
        documents,
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{body_json, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    const BOUNDARY: &str = "docflow-test-boundary";

    fn multipart_request(files: &[(&str, &str, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (field, filename, content) in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));

        Request::post("/api/documents")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_lists_and_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .clone()
            .oneshot(multipart_request(&[
                ("file", "a.txt", "alpha"),
                ("note", "ignored.txt", "skip me"),
                ("file", "b.txt", "beta"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let uploaded = body_json(response).await;
        let uploaded = uploaded.as_array().unwrap();
        assert_eq!(uploaded.len(), 2);
        assert_eq!(uploaded[0]["filename"], "a.txt");
        assert_eq!(uploaded[0]["status"], "pending");
        assert!(uploaded[0]["task_id"].is_string());

        let id = uploaded[1]["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/documents/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let document = body_json(response).await;
        assert_eq!(document["filename"], "b.txt");
        assert!(document.get("filepath").is_none());

        let response = app
            .oneshot(Request::get("/api/documents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_without_file_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(multipart_request(&[("note", "n.txt", "hello")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_delete_then_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (app, service) = test_app(dir.path());
        let uploaded = service.upload_document(b"text", "a.txt").await.unwrap();
        let uri = format!("/api/documents/{}", uploaded.id);

        let response = app
            .clone()
            .oneshot(Request::delete(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        let response = app
            .oneshot(Request::delete(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_process_and_process_all() {
        let dir = tempfile::tempdir().unwrap();
        let (app, service) = test_app(dir.path());
        let uploaded = service.upload_document(b"text", "a.txt").await.unwrap();
        let process = |id: &str| {
            Request::post(format!("/api/documents/{id}/process"))
                .body(Body::empty())
                .unwrap()
        };
        let process_all = || {
            Request::post("/api/documents/process-all")
                .body(Body::empty())
                .unwrap()
        };

        // the upload already queued it
        let response = app.clone().oneshot(process(uploaded.id.as_str())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "already_queued");

        let response = app.clone().oneshot(process_all()).await.unwrap();
        assert_eq!(body_json(response).await["queued"], 0);

        service.queue.fail(&uploaded.task_id, "boom", false).unwrap();

        let response = app.clone().oneshot(process(uploaded.id.as_str())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let queued = body_json(response).await;
        assert_eq!(queued["document_id"], uploaded.id.as_str());
        assert_ne!(queued["task_id"], uploaded.task_id.as_str());

        let response = app.clone().oneshot(process_all()).await.unwrap();
        assert_eq!(body_json(response).await["queued"], 0);
        assert_eq!(service.queue.stats().unwrap().pending, 1);

        let response = app
            .oneshot(
                Request::get(format!("/api/documents/{}/logs", uploaded.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_unknown_document_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(
                Request::post("/api/documents/missing/process")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chunks_of_unprocessed_and_unknown_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (app, service) = test_app(dir.path());
        let uploaded = service.upload_document(b"text", "a.txt").await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/documents/{}/chunks", uploaded.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.as_array().unwrap().is_empty());

        let response = app
            .oneshot(
                Request::get("/api/documents/missing/chunks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
