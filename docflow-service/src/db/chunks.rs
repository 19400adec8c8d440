//! Chunk and embedding storage.

use chrono::Utc;
use rusqlite::params;

use super::models::StoredChunk;
use super::{Database, to_timestamp};
use crate::error::{DatabaseError, ServiceResult};
use crate::pipeline::ChunkDraft;

impl Database {
    /// Replace every chunk of a document, with embeddings, in one transaction.
    ///
    /// `embeddings[i]` belongs to `chunks[i]`; a chunk without a matching
    /// vector is stored without one.
    pub fn replace_document_chunks(
        &self,
        document_id: &str,
        chunks: &[ChunkDraft],
        embeddings: &[Vec<f32>],
    ) -> ServiceResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;

        let now = to_timestamp(&Utc::now());
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, title, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    chunk_id,
                    document_id,
                    chunk.index as i64,
                    chunk.title,
                    chunk.content,
                    now
                ],
            )
            .map_err(DatabaseError::Query)?;

            if let Some(embedding) = embeddings.get(i) {
                let embedding_bytes: Vec<u8> =
                    embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
                tx.execute(
                    "INSERT OR REPLACE INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
                    params![chunk_id, embedding_bytes],
                )
                .map_err(DatabaseError::Query)?;
            }
        }

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(chunks.len())
    }

    /// Chunks of a document in index order
    pub fn get_chunks(&self, document_id: &str) -> ServiceResult<Vec<StoredChunk>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, chunk_index, title, content, created_at \
                 FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
            )
            .map_err(DatabaseError::Query)?;

        let chunks = stmt
            .query_map(params![document_id], StoredChunk::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(chunks)
    }

    /// Top `limit` embedded chunks by cosine similarity to `query_embedding`,
    /// most similar first.
    pub fn search_chunks(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> ServiceResult<Vec<(StoredChunk, f32)>> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT c.id, c.document_id, c.chunk_index, c.title, c.content, c.created_at,
                       e.embedding
                FROM chunks c
                JOIN chunk_embeddings e ON c.id = e.chunk_id
                "#,
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], |row| {
                let embedding_bytes: Vec<u8> = row.get(6)?;
                Ok((StoredChunk::from_row(row)?, embedding_bytes))
            })
            .map_err(DatabaseError::Query)?;

        let mut results = Vec::new();
        for row in rows {
            let (chunk, embedding_bytes) = row.map_err(DatabaseError::Query)?;
            let similarity = cosine_similarity(query_embedding, &decode_embedding(&embedding_bytes));
            results.push((chunk, similarity));
        }

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }

    #[cfg(test)]
    pub fn get_chunk_embedding(&self, chunk_id: &str) -> ServiceResult<Option<Vec<f32>>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn();

        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM chunk_embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(bytes.as_deref().map(decode_embedding))
    }
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Zero when the lengths differ or either vector is all zeros.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(index: usize, content: &str) -> ChunkDraft {
        ChunkDraft {
            index,
            title: format!("Chunk {}", index + 1),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_replace_chunks_with_embeddings() {
        let db = Database::open_in_memory().unwrap();
        let doc = db.create_document("a.txt", "a", 1).unwrap();

        let chunks = vec![draft(0, "alpha"), draft(1, "beta")];
        let embeddings = vec![vec![0.5, -1.25], vec![3.0, 0.0]];
        assert_eq!(
            db.replace_document_chunks(&doc.id, &chunks, &embeddings).unwrap(),
            2
        );

        let stored = db.get_chunks(&doc.id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "alpha");
        assert_eq!(stored[1].title, "Chunk 2");
        assert_eq!(
            db.get_chunk_embedding(&stored[0].id).unwrap(),
            Some(vec![0.5, -1.25])
        );

        // a second run replaces rather than appends
        db.replace_document_chunks(&doc.id, &[draft(0, "gamma")], &[vec![1.0]])
            .unwrap();
        assert_eq!(db.get_chunks(&doc.id).unwrap().len(), 1);
        assert!(db.get_chunk_embedding(&stored[0].id).unwrap().is_none());
    }

    #[test]
    fn test_chunks_removed_with_document() {
        let db = Database::open_in_memory().unwrap();
        let doc = db.create_document("a.txt", "a", 1).unwrap();
        db.replace_document_chunks(&doc.id, &[draft(0, "x")], &[vec![1.0]])
            .unwrap();

        db.delete_document(&doc.id).unwrap();
        assert!(db.get_chunks(&doc.id).unwrap().is_empty());
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_document("a.txt", "a", 1).unwrap();
        let b = db.create_document("b.txt", "b", 1).unwrap();
        db.replace_document_chunks(
            &a.id,
            &[draft(0, "east"), draft(1, "north")],
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
        )
        .unwrap();
        // the second chunk has no vector and is never a hit
        db.replace_document_chunks(
            &b.id,
            &[draft(0, "north-east"), draft(1, "bare")],
            &[vec![1.0, 1.0]],
        )
        .unwrap();

        let hits = db.search_chunks(&[0.0, 2.0], 10).unwrap();
        let contents: Vec<&str> = hits.iter().map(|(c, _)| c.content.as_str()).collect();
        assert_eq!(contents, ["north", "north-east", "east"]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!(hits[2].1.abs() < 1e-6);

        assert_eq!(db.search_chunks(&[0.0, 2.0], 1).unwrap().len(), 1);
        assert!(db.search_chunks(&[1.0, 0.0, 0.0], 1).unwrap()[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[3.0, 4.0], &[6.0, 8.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
