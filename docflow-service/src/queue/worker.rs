//! Worker loop and task handler registry.
//!
//! Each worker polls the shared queue, claims one task at a time, runs the
//! handler registered under the task's name, and reports the outcome. A
//! handler failure or panic fails the task; the loop itself keeps going.
//! While a handler runs the worker renews its claim every third of the
//! lease, so only a dead worker's tasks are reaped.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{QueuedTask, TaskQueue};
use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::pipeline::{ErrorKind, Orchestrator, StageError};

/// Task name used for document pipeline runs
pub const PROCESS_DOCUMENT: &str = "process_document";

/// Executes one kind of queued task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the JSON result stored on the completed task.
    async fn run(&self, task: &QueuedTask) -> Result<Value, StageError>;
}

/// Name-keyed task handlers
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }
}

pub struct Worker {
    id: usize,
    queue: TaskQueue,
    handlers: Arc<HandlerRegistry>,
    poll_interval: Duration,
    error_backoff: Duration,
    heartbeat_interval: Duration,
}

/// Renewal period for a claim held under `lease`
fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

impl Worker {
    pub fn new(
        id: usize,
        queue: TaskQueue,
        handlers: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let heartbeat_interval = heartbeat_interval(queue.lease());
        Self {
            id,
            queue,
            handlers,
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            heartbeat_interval,
        }
    }

    /// Poll until `shutdown` is cancelled. A task in flight is finished
    /// before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = self.id, "Worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!(
                        worker = self.id,
                        error = %crate::error::format_error_chain(&e),
                        "Failed to poll task queue"
                    );
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Claim and execute at most one task. Returns whether a task ran.
    pub async fn poll_once(&self) -> Result<bool, QueueError> {
        match self.queue.dequeue()? {
            Some(task) => {
                self.execute(task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn execute(&self, task: QueuedTask) {
        let Some(handler) = self.handlers.get(&task.name) else {
            warn!(worker = self.id, task_id = %task.id, task_name = %task.name, "No handler for task");
            let message = format!("No handler registered for task '{}'", task.name);
            self.report(self.queue.fail_claimed(&task, &message, false).map(|_| ()), &task);
            return;
        };

        debug!(
            worker = self.id,
            task_id = %task.id,
            task_name = %task.name,
            attempt = task.retry_count + 1,
            "Running task"
        );

        let run = AssertUnwindSafe(handler.run(&task)).catch_unwind();
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => self.renew(&task),
            }
        };

        let reported = match outcome {
            Ok(Ok(result)) => self.queue.complete_claimed(&task, Some(&result)).map(|_| ()),
            Ok(Err(e)) => {
                let message = format!("{}: {}", e.kind, e);
                self.queue
                    .fail_claimed(&task, &message, e.retryable)
                    .map(|_| ())
            }
            Err(panic) => {
                let error = StageError::non_retryable(
                    ErrorKind::Unknown,
                    format!("Handler panicked: {}", panic_message(panic.as_ref())),
                );
                error!(worker = self.id, task_id = %task.id, error = %error, "Task handler panicked");
                self.queue
                    .fail_claimed(&task, &error.message, false)
                    .map(|_| ())
            }
        };

        self.report(reported, &task);
    }

    fn renew(&self, task: &QueuedTask) {
        match self.queue.renew_lease(task) {
            Ok(true) => debug!(worker = self.id, task_id = %task.id, "Lease renewed"),
            Ok(false) => {
                warn!(worker = self.id, task_id = %task.id, "Lease lost while task is running")
            }
            Err(e) => warn!(
                worker = self.id,
                task_id = %task.id,
                error = %crate::error::format_error_chain(&e),
                "Failed to renew lease"
            ),
        }
    }

    /// The task stays `processing` if its outcome cannot be stored; the
    /// reaper releases it once the lease expires.
    fn report(&self, result: Result<(), QueueError>, task: &QueuedTask) {
        if let Err(e) = result {
            error!(
                worker = self.id,
                task_id = %task.id,
                error = %crate::error::format_error_chain(&e),
                "Failed to record task outcome"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Start `config.concurrency` workers sharing one queue.
pub fn spawn_pool(
    queue: &TaskQueue,
    handlers: Arc<HandlerRegistry>,
    config: &WorkerConfig,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.concurrency.max(1))
        .map(|id| {
            let worker = Worker::new(id, queue.clone(), handlers.clone(), config);
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

/// Runs the document pipeline for `kwargs.document_id` (or the first
/// positional argument).
pub struct ProcessDocumentHandler {
    orchestrator: Arc<Orchestrator>,
}

impl ProcessDocumentHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for ProcessDocumentHandler {
    async fn run(&self, task: &QueuedTask) -> Result<Value, StageError> {
        let doc_id = task
            .payload
            .get_str("document_id")
            .or_else(|| task.payload.args.first().and_then(Value::as_str))
            .ok_or_else(|| {
                StageError::non_retryable(ErrorKind::Unknown, "Task has no document_id")
            })?;

        let outcome = self.orchestrator.process(doc_id).await?;
        serde_json::to_value(&outcome).map_err(|e| {
            StageError::non_retryable(ErrorKind::Unknown, "Failed to encode task result")
                .with_cause(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnginesConfig, PipelineConfig};
    use crate::db::Database;
    use crate::pipeline::{BackoffPolicy, ErrorTracker, StageRegistry};
    use crate::queue::{TaskPayload, TaskStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        reply: fn(u32) -> Result<Value, StageError>,
    }

    impl Scripted {
        fn new(reply: fn(u32) -> Result<Value, StageError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                reply,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn run(&self, _task: &QueuedTask) -> Result<Value, StageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)(call)
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskHandler for Panicking {
        async fn run(&self, _task: &QueuedTask) -> Result<Value, StageError> {
            panic!("handler exploded");
        }
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(
            Arc::new(Database::open_in_memory().unwrap()),
            BackoffPolicy::new(Duration::ZERO, 2.0, Duration::ZERO),
            3,
        )
    }

    fn worker(queue: &TaskQueue, handlers: HandlerRegistry) -> Worker {
        let config = WorkerConfig {
            concurrency: 1,
            poll_interval_ms: 5,
            error_backoff_secs: 1,
        };
        Worker::new(0, queue.clone(), Arc::new(handlers), &config)
    }

    #[tokio::test]
    async fn test_success_completes_task() {
        let queue = queue();
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Scripted::new(|_| Ok(serde_json::json!({"ok": true}))));
        let worker = worker(&queue, handlers);

        let id = queue.enqueue("echo", TaskPayload::new()).unwrap();
        assert!(worker.poll_once().await.unwrap());
        assert!(!worker.poll_once().await.unwrap());

        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_unknown_task_fails_without_retry() {
        let queue = queue();
        let worker = worker(&queue, HandlerRegistry::new());

        let id = queue.enqueue("mystery", TaskPayload::new()).unwrap();
        worker.poll_once().await.unwrap();

        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.unwrap().contains("mystery"));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered() {
        let queue = queue();
        let handler = Scripted::new(|call| {
            if call == 0 {
                Err(StageError::retryable(ErrorKind::Network, "connection reset"))
            } else {
                Ok(Value::Null)
            }
        });
        let mut handlers = HandlerRegistry::new();
        handlers.register("flaky", handler.clone());
        let worker = worker(&queue, handlers);

        let id = queue.enqueue("flaky", TaskPayload::new()).unwrap();
        worker.poll_once().await.unwrap();
        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.error_message.as_deref(), Some("network: connection reset"));

        worker.poll_once().await.unwrap();
        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let queue = queue();
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "broken",
            Scripted::new(|_| Err(StageError::non_retryable(ErrorKind::File, "gone"))),
        );
        let worker = worker(&queue, handlers);

        let id = queue.enqueue("broken", TaskPayload::new()).unwrap();
        worker.poll_once().await.unwrap();

        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_panic_fails_task_and_worker_continues() {
        let queue = queue();
        let mut handlers = HandlerRegistry::new();
        handlers.register("boom", Arc::new(Panicking));
        handlers.register("echo", Scripted::new(|_| Ok(Value::Null)));
        let worker = worker(&queue, handlers);

        let boom = queue.enqueue("boom", TaskPayload::new()).unwrap();
        let echo = queue.enqueue("echo", TaskPayload::new()).unwrap();
        worker.poll_once().await.unwrap();
        worker.poll_once().await.unwrap();

        let task = queue.get(&boom).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("handler exploded"));
        assert_eq!(
            queue.get(&echo).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let queue = queue();
        let handler = Scripted::new(|_| Ok(Value::Null));
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", handler.clone());

        let ids: Vec<_> = (0..6)
            .map(|_| queue.enqueue("echo", TaskPayload::new()).unwrap())
            .collect();

        let config = WorkerConfig {
            concurrency: 3,
            poll_interval_ms: 5,
            error_backoff_secs: 1,
        };
        let shutdown = CancellationToken::new();
        let workers = spawn_pool(&queue, Arc::new(handlers), &config, &shutdown);

        for _ in 0..200 {
            if queue.stats().unwrap().completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
        for id in ids {
            assert_eq!(queue.get(&id).unwrap().unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_process_document_requires_document_id() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orchestrator = Orchestrator::new(
            db.clone(),
            Arc::new(StageRegistry::new()),
            Arc::new(ErrorTracker::new()),
            EnginesConfig::default(),
            PipelineConfig::default(),
        );
        let queue = TaskQueue::new(db, BackoffPolicy::default(), 3);
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            PROCESS_DOCUMENT,
            Arc::new(ProcessDocumentHandler::new(Arc::new(orchestrator))),
        );
        let worker = worker(&queue, handlers);

        let id = queue.enqueue(PROCESS_DOCUMENT, TaskPayload::new()).unwrap();
        worker.poll_once().await.unwrap();

        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("document_id"));
    }

    struct Slow(Duration);

    #[async_trait]
    impl TaskHandler for Slow {
        async fn run(&self, _task: &QueuedTask) -> Result<Value, StageError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_heartbeat_interval_is_a_third_of_the_lease() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(1800)),
            Duration::from_secs(600)
        );
        assert_eq!(heartbeat_interval(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_long_task_outlives_its_lease() {
        let queue = queue().with_lease(Duration::from_millis(90));
        let mut handlers = HandlerRegistry::new();
        handlers.register("slow", Arc::new(Slow(Duration::from_millis(300))));
        let worker = worker(&queue, handlers);
        let id = queue.enqueue("slow", TaskPayload::new()).unwrap();

        let reaper = async {
            let mut released = 0;
            for _ in 0..25 {
                tokio::time::sleep(Duration::from_millis(15)).await;
                released += queue.requeue_stale(queue.lease()).unwrap();
            }
            released
        };
        let (ran, released) = tokio::join!(worker.poll_once(), reaper);

        assert!(ran.unwrap());
        assert_eq!(released, 0);
        let task = queue.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
    }
}
