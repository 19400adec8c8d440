//! HTTP API for the document pipeline.
//!
//! This module provides the REST endpoints for:
//! - Health and Prometheus metrics
//! - Document upload, inspection, deletion, and (re)processing
//! - Task lookup and aggregate statistics
//! - Similarity search over stored chunks

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServiceError;
use crate::queue::QueuedTask;
use crate::service::{DocflowService, ServiceStats};

pub mod documents;
pub mod search;
use documents::{
    delete_document_handler, document_chunks_handler, document_logs_handler, get_document_handler,
    list_documents_handler, process_all_handler, process_document_handler,
    upload_documents_handler,
};
use search::search_handler;

/// Application state
pub struct AppState {
    pub service: Arc<DocflowService>,
    pub start_time: Instant,
    /// Absent when no global recorder was installed (tests)
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router
pub fn router(service: Arc<DocflowService>, metrics: Option<PrometheusHandle>) -> Router {
    let max_body_size = service.config.storage.max_upload_bytes as usize;

    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/documents",
            get(list_documents_handler)
                .post(upload_documents_handler)
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/documents/process-all", post(process_all_handler))
        .route(
            "/documents/{id}",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route("/documents/{id}/logs", get(document_logs_handler))
        .route("/documents/{id}/chunks", get(document_chunks_handler))
        .route("/documents/{id}/process", post(process_document_handler))
        .route("/tasks/{id}", get(get_task_handler))
        .route("/stats", get(stats_handler))
        .route("/search", post(search_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_available = state.service.queue.stats().is_ok();

    Json(HealthResponse {
        status: if store_available { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        store_available,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    store_available: bool,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

// === Tasks & Stats ===

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QueuedTask>, ServiceError> {
    Ok(Json(state.service.get_task(&id)?))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ServiceStats>, ServiceError> {
    Ok(Json(state.service.stats()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    pub(crate) fn test_app(data_dir: &std::path::Path) -> (Router, Arc<DocflowService>) {
        let mut config = AppConfig::default();
        config.storage.data_dir = data_dir.to_path_buf();
        config.engines.embedder = "hashing".to_string();

        let db = Arc::new(Database::open_in_memory().unwrap());
        let service = Arc::new(DocflowService::new(db, config).unwrap());
        (router(service.clone(), None), service)
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store_available"], true);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(Request::get("/api/tasks/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "task_not_found");
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let response = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["documents"]["total_documents"], 0);
        assert_eq!(body["queue"]["pending"], 0);
        assert_eq!(body["errors"]["total_errors"], 0);
    }
}
