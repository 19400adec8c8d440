use async_trait::async_trait;
use std::sync::Arc;

use crate::db::Database;
use crate::pipeline::{BoxError, ChunkDraft, ErrorKind, SearchHit, StageError, VectorStore};

/// Chunks and vectors in the service's own SQLite database.
pub struct SqliteVectorStore {
    db: Arc<Database>,
}

impl SqliteVectorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn store(
        &self,
        document_id: &str,
        chunks: &[ChunkDraft],
        embeddings: &[Vec<f32>],
    ) -> Result<usize, BoxError> {
        if chunks.len() != embeddings.len() {
            return Err(Box::new(StageError::non_retryable(
                ErrorKind::Database,
                format!(
                    "{} chunks but {} embeddings for document {document_id}",
                    chunks.len(),
                    embeddings.len()
                ),
            )));
        }

        let db = Arc::clone(&self.db);
        let document_id = document_id.to_string();
        let chunks = chunks.to_vec();
        let embeddings = embeddings.to_vec();

        let stored = tokio::task::spawn_blocking(move || {
            db.replace_document_chunks(&document_id, &chunks, &embeddings)
        })
        .await??;

        Ok(stored)
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<SearchHit>, BoxError> {
        let db = Arc::clone(&self.db);
        let embedding = embedding.to_vec();

        let ranked = tokio::task::spawn_blocking(move || db.search_chunks(&embedding, limit))
            .await??;

        Ok(ranked
            .into_iter()
            .map(|(chunk, similarity)| SearchHit {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                chunk_index: chunk.chunk_index,
                title: chunk.title,
                content: chunk.content,
                similarity,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classify;

    fn draft(index: usize, content: &str) -> ChunkDraft {
        ChunkDraft {
            index,
            title: format!("Chunk {}", index + 1),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_replaces_previous_chunks() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let doc = db.create_document("a.txt", "/tmp/a.txt", 10).unwrap();
        let store = SqliteVectorStore::new(Arc::clone(&db));

        let stored = store
            .store(
                &doc.id,
                &[draft(0, "one"), draft(1, "two")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await
            .unwrap();
        assert_eq!(stored, 2);

        store
            .store(&doc.id, &[draft(0, "only")], &[vec![0.5, 0.5]])
            .await
            .unwrap();

        let chunks = db.get_chunks(&doc.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "only");
        assert_eq!(
            db.get_chunk_embedding(&chunks[0].id).unwrap(),
            Some(vec![0.5, 0.5])
        );
    }

    #[tokio::test]
    async fn test_length_mismatch_is_fatal() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = SqliteVectorStore::new(db);

        let err = store
            .store("doc", &[draft(0, "one")], &[])
            .await
            .unwrap_err();
        let classified = classify(err, None);
        assert_eq!(classified.kind, ErrorKind::Database);
        assert!(!classified.retryable);
    }

    #[tokio::test]
    async fn test_search_returns_nearest_chunks() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let doc = db.create_document("a.txt", "/tmp/a.txt", 10).unwrap();
        let store = SqliteVectorStore::new(Arc::clone(&db));
        store
            .store(
                &doc.id,
                &[draft(0, "one"), draft(1, "two")],
                &[vec![1.0, 0.0], vec![0.6, 0.8]],
            )
            .await
            .unwrap();

        let hits = store.search(&[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "two");
        assert_eq!(hits[0].chunk_index, 1);
        assert_eq!(hits[0].document_id, doc.id);
        assert!((hits[0].similarity - 0.8).abs() < 1e-6);
        assert_eq!(hits[1].title, "Chunk 1");
    }
}
