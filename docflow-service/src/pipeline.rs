//! Document processing pipeline.
//!
//! Failure classification, backoff and bounded retry, the per-document
//! circuit breaker, and the orchestrator that drives a document through
//! parse, chunk, embed, and store.

mod backoff;
mod classify;
mod orchestrator;
mod retry;
mod stages;
mod tracker;

pub use backoff::BackoffPolicy;
pub use classify::{BoxError, ErrorDomain, ErrorKind, StageError, classify};
pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use stages::{
    ChunkDraft, Chunker, Embedder, ParsedDocument, Parser, SearchHit, Stage, StageRegistry,
    VectorStore,
};
pub use tracker::{ErrorSummary, ErrorTracker};
