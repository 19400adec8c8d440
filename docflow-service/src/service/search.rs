//! Reads over stored chunks: per-document listing and similarity search.

use tracing::debug;

use super::DocflowService;
use crate::db::StoredChunk;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::{ChunkDraft, ErrorDomain, ErrorKind, SearchHit, StageError, classify};

/// Upper bound on hits returned by one search
pub const MAX_SEARCH_LIMIT: usize = 100;

impl DocflowService {
    /// Chunks written by the last successful run, in index order
    pub fn document_chunks(&self, document_id: &str) -> ServiceResult<Vec<StoredChunk>> {
        self.get_document(document_id)?;
        self.db.get_chunks(document_id)
    }

    /// Embed `query` with the configured embedder and return the nearest
    /// stored chunks across all documents.
    pub async fn search(&self, query: &str, limit: usize) -> ServiceResult<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "Query must not be empty".to_string(),
            });
        }
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);

        let stages = self
            .registry
            .resolve(&self.config.engines)
            .map_err(ServiceError::Search)?;

        let draft = ChunkDraft {
            index: 0,
            title: "query".to_string(),
            content: query.to_string(),
        };
        let vector = stages
            .embedder
            .embed(std::slice::from_ref(&draft))
            .await
            .map_err(|e| ServiceError::Search(classify(e, Some(ErrorDomain::ExternalApi))))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceError::Search(StageError::non_retryable(
                    ErrorKind::ExternalApi,
                    "Embedder returned no vector for the query",
                ))
            })?;

        let hits = stages
            .store
            .search(&vector, limit)
            .await
            .map_err(|e| ServiceError::Search(classify(e, Some(ErrorDomain::Database))))?;

        debug!(limit, hits = hits.len(), "Search complete");
        Ok(hits)
    }
}
