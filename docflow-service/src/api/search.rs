//! Similarity search over stored chunks.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ServiceError;
use crate::pipeline::SearchHit;

use super::AppState;

const DEFAULT_LIMIT: usize = 10;

/// Search request
#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
}

/// Search response
#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

/// Rank stored chunks against the embedded query
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ServiceError> {
    let results = state
        .service
        .search(&request.query, request.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(Json(SearchResponse { results }))
}
