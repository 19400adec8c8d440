//! Stage names, engine contracts, and the name-keyed engine registry.
//!
//! The orchestrator never holds an engine directly. It resolves the
//! configured names through [`StageRegistry`] on every run so engines can
//! be swapped without touching the state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};

use super::classify::{BoxError, ErrorDomain, ErrorKind, StageError};
use crate::config::EnginesConfig;

/// One of the four sequential processing steps.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Parsing,
    Chunking,
    Embedding,
    Storing,
}

impl Stage {
    #[cfg(test)]
    pub const ALL: [Stage; 4] = [
        Stage::Parsing,
        Stage::Chunking,
        Stage::Embedding,
        Stage::Storing,
    ];

    /// Progress reported when the stage begins.
    pub fn start_progress(self) -> u8 {
        match self {
            Stage::Parsing => 10,
            Stage::Chunking => 40,
            Stage::Embedding => 70,
            Stage::Storing => 95,
        }
    }

    /// Progress reported once the stage has succeeded.
    pub fn done_progress(self) -> u8 {
        match self {
            Stage::Parsing => 30,
            Stage::Chunking => 60,
            Stage::Embedding => 90,
            Stage::Storing => 100,
        }
    }

    /// Keyword rules used when a failure from this stage is untyped.
    pub fn domain(self) -> ErrorDomain {
        match self {
            Stage::Parsing | Stage::Chunking => ErrorDomain::Parsing,
            Stage::Embedding => ErrorDomain::ExternalApi,
            Stage::Storing => ErrorDomain::Database,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Storing => "storing",
        }
    }

    /// Human readable description used in status messages
    pub fn activity(self) -> &'static str {
        match self {
            Stage::Parsing => "Parsing document",
            Stage::Chunking => "Chunking text",
            Stage::Embedding => "Generating embeddings",
            Stage::Storing => "Storing vectors",
        }
    }
}

/// Text extracted from a source file
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub content: String,
    pub total_pages: Option<u32>,
}

/// A chunk produced by a chunker, before it has an embedding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkDraft {
    pub index: usize,
    pub title: String,
    pub content: String,
}

/// Extracts text from a stored upload.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument, BoxError>;
}

/// Splits parsed text into chunks.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, document: &ParsedDocument) -> Result<Vec<ChunkDraft>, BoxError>;
}

/// Produces one vector per chunk, in chunk order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, chunks: &[ChunkDraft]) -> Result<Vec<Vec<f32>>, BoxError>;
}

/// A stored chunk ranked against a query vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub title: String,
    pub content: String,
    pub similarity: f32,
}

/// Persists a document's chunks and their vectors, and finds the chunks
/// nearest to a query vector.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace the document's chunks. Returns the number stored.
    async fn store(
        &self,
        document_id: &str,
        chunks: &[ChunkDraft],
        embeddings: &[Vec<f32>],
    ) -> Result<usize, BoxError>;

    /// Up to `limit` hits, most similar first.
    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<SearchHit>, BoxError>;
}

/// The engines selected for one pipeline run
#[derive(Clone)]
pub struct StageSet {
    pub parser: Arc<dyn Parser>,
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
}

/// Name-keyed engine registry
#[derive(Default, Clone)]
pub struct StageRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
    chunkers: HashMap<String, Arc<dyn Chunker>>,
    embedders: HashMap<String, Arc<dyn Embedder>>,
    stores: HashMap<String, Arc<dyn VectorStore>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_parser(&mut self, name: impl Into<String>, parser: Arc<dyn Parser>) {
        self.parsers.insert(name.into(), parser);
    }

    pub fn register_chunker(&mut self, name: impl Into<String>, chunker: Arc<dyn Chunker>) {
        self.chunkers.insert(name.into(), chunker);
    }

    pub fn register_embedder(&mut self, name: impl Into<String>, embedder: Arc<dyn Embedder>) {
        self.embedders.insert(name.into(), embedder);
    }

    pub fn register_store(&mut self, name: impl Into<String>, store: Arc<dyn VectorStore>) {
        self.stores.insert(name.into(), store);
    }

    /// Look up the engines named in `engines`.
    ///
    /// A missing name is a configuration problem and never retryable.
    pub fn resolve(&self, engines: &EnginesConfig) -> Result<StageSet, StageError> {
        Ok(StageSet {
            parser: lookup(&self.parsers, "parser", &engines.parser)?,
            chunker: lookup(&self.chunkers, "chunker", &engines.chunker)?,
            embedder: lookup(&self.embedders, "embedder", &engines.embedder)?,
            store: lookup(&self.stores, "store", &engines.store)?,
        })
    }
}

fn lookup<T: ?Sized>(
    map: &HashMap<String, Arc<T>>,
    role: &str,
    name: &str,
) -> Result<Arc<T>, StageError> {
    map.get(name).cloned().ok_or_else(|| {
        StageError::non_retryable(
            ErrorKind::Unknown,
            format!("No {role} registered under '{name}'"),
        )
    })
}
