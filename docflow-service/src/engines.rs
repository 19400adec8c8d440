//! Built-in stage engines and the registry the service starts with.

mod chunker;
mod hashing;
mod ollama;
mod sqlite;
mod text;

use std::sync::Arc;

pub use chunker::FixedSizeChunker;
pub use hashing::HashingEmbedder;
pub use ollama::OllamaEmbedder;
pub use sqlite::SqliteVectorStore;
pub use text::TextParser;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::ServiceResult;
use crate::pipeline::StageRegistry;

/// Register every built-in engine under its configuration name.
pub fn default_registry(db: Arc<Database>, config: &AppConfig) -> ServiceResult<StageRegistry> {
    let mut registry = StageRegistry::new();

    registry.register_parser("text", Arc::new(TextParser));
    registry.register_chunker(
        "fixed",
        Arc::new(FixedSizeChunker::new(
            config.engines.chunk_size,
            config.engines.chunk_overlap,
        )),
    );
    registry.register_embedder("ollama", Arc::new(OllamaEmbedder::new(&config.ollama)?));
    registry.register_embedder("hashing", Arc::new(HashingEmbedder::default()));
    registry.register_store("sqlite", Arc::new(SqliteVectorStore::new(db)));

    Ok(registry)
}
