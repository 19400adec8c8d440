mod documents;
mod search;

pub use documents::{QueuedDocument, ServiceStats, UploadedDocument};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::engines;
use crate::error::ServiceResult;
use crate::pipeline::{ErrorTracker, Orchestrator, StageRegistry};
use crate::queue::worker::PROCESS_DOCUMENT;
use crate::queue::{HandlerRegistry, ProcessDocumentHandler, Reaper, TaskQueue, spawn_pool};

/// Main service coordinator
pub struct DocflowService {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub queue: TaskQueue,
    pub tracker: Arc<ErrorTracker>,
    registry: Arc<StageRegistry>,
    handlers: Arc<HandlerRegistry>,
}

impl DocflowService {
    /// Create a service wired to the built-in stage engines
    pub fn new(db: Arc<Database>, config: AppConfig) -> ServiceResult<Self> {
        let registry = engines::default_registry(db.clone(), &config)?;
        Ok(Self::with_registry(db, config, registry))
    }

    /// Create a service with a caller-supplied engine registry
    pub fn with_registry(db: Arc<Database>, config: AppConfig, registry: StageRegistry) -> Self {
        let tracker = Arc::new(ErrorTracker::new());
        let registry = Arc::new(registry);
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            registry.clone(),
            tracker.clone(),
            config.engines.clone(),
            config.pipeline.clone(),
        ));

        let mut handlers = HandlerRegistry::new();
        handlers.register(
            PROCESS_DOCUMENT,
            Arc::new(ProcessDocumentHandler::new(orchestrator)),
        );

        let queue = TaskQueue::from_config(db.clone(), &config.queue);

        info!(
            parser = %config.engines.parser,
            chunker = %config.engines.chunker,
            embedder = %config.engines.embedder,
            store = %config.engines.store,
            "Document pipeline configured"
        );

        Self {
            config,
            db,
            queue,
            tracker,
            registry,
            handlers: Arc::new(handlers),
        }
    }

    /// Spawn the worker pool and the queue maintenance loops.
    pub fn start_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = spawn_pool(
            &self.queue,
            self.handlers.clone(),
            &self.config.worker,
            shutdown,
        );
        handles.push(Reaper::new(self.queue.clone(), &self.config.queue).start(shutdown.clone()));

        info!(
            workers = self.config.worker.concurrency.max(1),
            "Background processing started"
        );
        handles
    }

    /// Single worker over this service's queue, for driving tasks by hand
    #[cfg(test)]
    pub(crate) fn test_worker(&self) -> crate::queue::worker::Worker {
        crate::queue::worker::Worker::new(
            0,
            self.queue.clone(),
            self.handlers.clone(),
            &self.config.worker,
        )
    }
}
