//! Per-document state machine.
//!
//! `pending -> parsing -> chunking -> embedding -> storing -> completed`,
//! with `error` reachable from every non-terminal state. Each stage runs
//! under the retry wrapper with its own budget and a per-attempt deadline.
//! Status is persisted before the next stage starts.

use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::classify::{BoxError, ErrorDomain, ErrorKind, StageError, classify};
use super::retry::retry_with_backoff;
use super::stages::{ChunkDraft, ParsedDocument, Stage, StageRegistry, StageSet};
use super::tracker::ErrorTracker;
use crate::config::{EnginesConfig, PipelineConfig};
use crate::db::{Database, DocumentRecord, DocumentStatus, LogStatus};
use crate::error::{ServiceError, ServiceResult};

/// How a pipeline run ended without a stage failure
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed {
        chunks_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_pages: Option<u32>,
        duration_secs: f64,
    },
    /// The circuit breaker refused to run the pipeline
    Skipped { error_count: u32 },
}

pub struct Orchestrator {
    db: Arc<Database>,
    registry: Arc<StageRegistry>,
    tracker: Arc<ErrorTracker>,
    engines: EnginesConfig,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<StageRegistry>,
        tracker: Arc<ErrorTracker>,
        engines: EnginesConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            registry,
            tracker,
            engines,
            config,
        }
    }

    /// Run the full pipeline for one document.
    ///
    /// A stage failure that survives its retries moves the document to
    /// `error` and is returned. Its retry verdict is kept so the caller
    /// can decide on redelivery.
    pub async fn process(&self, doc_id: &str) -> Result<Outcome, StageError> {
        if self.tracker.should_skip(doc_id, self.config.skip_threshold) {
            return Ok(self.skip(doc_id));
        }

        let document = self.load(doc_id)?;
        let started = Instant::now();
        info!(doc_id = %doc_id, filename = %document.filename, "Starting document pipeline");

        let stages = match self.registry.resolve(&self.engines) {
            Ok(stages) => stages,
            Err(e) => return Err(self.fail_document(doc_id, Stage::Parsing, Duration::ZERO, e)),
        };

        let parsed = self.parse(&document, &stages).await?;
        let chunks = self.chunk(doc_id, &stages, parsed.clone()).await?;
        let embeddings = self.embed(doc_id, &stages, chunks.clone()).await?;
        let stored = self.store(doc_id, &stages, chunks, embeddings).await?;

        let duration = started.elapsed();
        let message = format!("Processing complete ({:.1}s)", duration.as_secs_f64());
        self.persist(doc_id, Stage::Storing, || {
            self.db
                .update_document_status(doc_id, DocumentStatus::Completed, 100, &message)?;
            self.db
                .set_processing_duration(doc_id, duration.as_secs_f64())
        })?;

        metrics::counter!("docflow_documents_completed_total").increment(1);
        info!(
            doc_id = %doc_id,
            chunks = stored,
            duration_ms = duration.as_millis() as u64,
            "Document processing complete"
        );

        Ok(Outcome::Completed {
            chunks_count: stored,
            total_pages: parsed.total_pages,
            duration_secs: duration.as_secs_f64(),
        })
    }

    async fn parse(
        &self,
        document: &DocumentRecord,
        stages: &StageSet,
    ) -> Result<Arc<ParsedDocument>, StageError> {
        let doc_id = document.id.as_str();
        let path = PathBuf::from(&document.filepath);
        let parsed = self
            .run_stage(doc_id, Stage::Parsing, || {
                let parser = stages.parser.clone();
                let path = path.clone();
                async move { parser.parse(&path).await }
            })
            .await?;

        let message = match parsed.total_pages {
            Some(pages) => format!("Parsed {pages} pages"),
            None => "Parsed document".to_string(),
        };
        self.persist(doc_id, Stage::Parsing, || {
            self.db
                .update_document_results(doc_id, parsed.total_pages, None)?;
            self.advance(doc_id, Stage::Parsing, &message)
        })?;

        Ok(Arc::new(parsed))
    }

    async fn chunk(
        &self,
        doc_id: &str,
        stages: &StageSet,
        parsed: Arc<ParsedDocument>,
    ) -> Result<Arc<Vec<ChunkDraft>>, StageError> {
        let chunks = self
            .run_stage(doc_id, Stage::Chunking, || {
                let chunker = stages.chunker.clone();
                let parsed = parsed.clone();
                async move { chunker.chunk(&parsed).await }
            })
            .await?;

        let count = chunks.len();
        self.persist(doc_id, Stage::Chunking, || {
            self.db
                .update_document_results(doc_id, None, Some(count as u32))?;
            self.advance(doc_id, Stage::Chunking, &format!("Created {count} chunks"))
        })?;

        Ok(Arc::new(chunks))
    }

    async fn embed(
        &self,
        doc_id: &str,
        stages: &StageSet,
        chunks: Arc<Vec<ChunkDraft>>,
    ) -> Result<Arc<Vec<Vec<f32>>>, StageError> {
        let embeddings = self
            .run_stage(doc_id, Stage::Embedding, || {
                let embedder = stages.embedder.clone();
                let chunks = chunks.clone();
                async move {
                    let vectors = embedder.embed(&chunks).await?;
                    if vectors.len() != chunks.len() {
                        let err: BoxError = Box::new(StageError::non_retryable(
                            ErrorKind::ExternalApi,
                            format!(
                                "Embedder returned {} vectors for {} chunks",
                                vectors.len(),
                                chunks.len()
                            ),
                        ));
                        return Err(err);
                    }
                    Ok::<_, BoxError>(vectors)
                }
            })
            .await?;

        let message = format!("Generated {} embeddings", embeddings.len());
        self.persist(doc_id, Stage::Embedding, || {
            self.advance(doc_id, Stage::Embedding, &message)
        })?;

        Ok(Arc::new(embeddings))
    }

    async fn store(
        &self,
        doc_id: &str,
        stages: &StageSet,
        chunks: Arc<Vec<ChunkDraft>>,
        embeddings: Arc<Vec<Vec<f32>>>,
    ) -> Result<usize, StageError> {
        let owned_id = doc_id.to_string();
        let stored = self
            .run_stage(doc_id, Stage::Storing, || {
                let store = stages.store.clone();
                let doc_id = owned_id.clone();
                let chunks = chunks.clone();
                let embeddings = embeddings.clone();
                async move { store.store(&doc_id, &chunks, &embeddings).await }
            })
            .await?;

        self.persist(doc_id, Stage::Storing, || {
            self.db
                .update_document_results(doc_id, None, Some(stored as u32))
        })?;

        Ok(stored)
    }

    /// Enter `stage`, run `op` under retry and deadline, and log the outcome.
    async fn run_stage<T, F, Fut>(
        &self,
        doc_id: &str,
        stage: Stage,
        mut op: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let started = Instant::now();
        self.persist(doc_id, stage, || {
            self.db.update_document_status(
                doc_id,
                stage.into(),
                stage.start_progress(),
                stage.activity(),
            )?;
            self.db.append_processing_log(
                doc_id,
                stage.as_str(),
                LogStatus::Started,
                Some(stage.activity()),
                None,
            )
        })?;
        debug!(doc_id = %doc_id, stage = %stage, "Stage started");

        let deadline = self.config.stage_timeout();
        let policy = self.config.retry_policy(stage);
        let result = retry_with_backoff(&policy, Some(stage.domain()), stage.as_str(), |_| {
            with_deadline(deadline, stage, op())
        })
        .await;

        let elapsed = started.elapsed();
        metrics::histogram!("docflow_stage_duration_seconds", "stage" => stage.as_str())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(value) => {
                self.persist(doc_id, stage, || {
                    self.db.append_processing_log(
                        doc_id,
                        stage.as_str(),
                        LogStatus::Completed,
                        Some(&format!("{} completed", stage.activity())),
                        Some(elapsed.as_secs_f64()),
                    )
                })?;
                info!(
                    doc_id = %doc_id,
                    stage = %stage,
                    duration_ms = elapsed.as_millis() as u64,
                    "Stage completed"
                );
                Ok(value)
            }
            Err(e) => Err(self.fail_document(doc_id, stage, elapsed, e)),
        }
    }

    fn advance(&self, doc_id: &str, stage: Stage, message: &str) -> ServiceResult<()> {
        self.db
            .update_document_status(doc_id, stage.into(), stage.done_progress(), message)
    }

    /// Run a status-store write; a failure ends the run in `error`.
    fn persist<F>(&self, doc_id: &str, stage: Stage, write: F) -> Result<(), StageError>
    where
        F: FnOnce() -> ServiceResult<()>,
    {
        write().map_err(|e| {
            let error = classify(Box::new(e), Some(ErrorDomain::Database));
            self.fail_document(doc_id, stage, Duration::ZERO, error)
        })
    }

    fn load(&self, doc_id: &str) -> Result<DocumentRecord, StageError> {
        match self.db.get_document(doc_id) {
            Ok(Some(document)) => Ok(document),
            Ok(None) => Err(StageError::non_retryable(
                ErrorKind::Database,
                format!("Document {doc_id} not found"),
            )),
            Err(e) => Err(classify(Box::new(e), Some(ErrorDomain::Database))),
        }
    }

    fn skip(&self, doc_id: &str) -> Outcome {
        let error_count = self.tracker.error_count(doc_id);
        let message = format!("Skipped: too many errors ({error_count})");
        warn!(doc_id = %doc_id, error_count, "Skipping document after repeated failures");

        if let Err(e) =
            self.db
                .update_document_status(doc_id, DocumentStatus::Error, 0, &message)
        {
            warn!(doc_id = %doc_id, error = %e, "Failed to mark skipped document");
        }

        Outcome::Skipped { error_count }
    }

    /// Record a terminal stage failure and move the document to `error`.
    fn fail_document(
        &self,
        doc_id: &str,
        stage: Stage,
        elapsed: Duration,
        error: StageError,
    ) -> StageError {
        let handled =
            self.tracker
                .log_and_handle(doc_id, Box::new(error), Some(stage.domain()), stage.as_str());
        let message = format!("{} failed: {}", stage.activity(), handled.message);

        if let Err(e) =
            self.db
                .update_document_status(doc_id, DocumentStatus::Error, 0, &message)
        {
            log_status_failure(doc_id, &e);
        }
        if let Err(e) = self.db.append_processing_log(
            doc_id,
            stage.as_str(),
            LogStatus::Failed,
            Some(&handled.message),
            Some(elapsed.as_secs_f64()),
        ) {
            log_status_failure(doc_id, &e);
        }

        metrics::counter!("docflow_documents_failed_total").increment(1);
        handled
    }
}

fn log_status_failure(doc_id: &str, error: &ServiceError) {
    warn!(
        doc_id = %doc_id,
        error = %crate::error::format_error_chain(error),
        "Failed to record document failure"
    );
}

async fn with_deadline<T, Fut>(deadline: Duration, stage: Stage, fut: Fut) -> Result<T, BoxError>
where
    Fut: Future<Output = Result<T, BoxError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Box::new(StageError::retryable(
            ErrorKind::Network,
            format!("{} timed out after {}s", stage.activity(), deadline.as_secs()),
        ))),
    }
}
