//! One long-running consumer of a filtered change stream.
//!
//! Grounded in `fc-stream::watcher::MongoStreamWatcher`'s reconnect-with-
//! backoff loop, generalised from a fixed batching pipeline to per-event
//! acknowledge/process dispatch, and in `fc-router::pool::ProcessPool`'s
//! semaphore-gated concurrency for the bounded-pool dispatch policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use fc_common::{ProcessingError, Result};

use crate::repository::{is_resumable, Repository};

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: u32 = 2;
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_POOL_WIDTH: usize = 5;

/// Inspects a document's post-image and decides whether its process should
/// run. Pure inspection: a returned error counts as `false`, matching the
/// "errors are caught and logged, never crash the consumer" discipline.
#[async_trait]
pub trait AcknowledgeCallback: Send + Sync {
    async fn acknowledge(&self, document: &Document) -> Result<bool>;
}

/// Does the actual work for a triggered process. Results become flat fields
/// under the process's subtree; an error is treated as `(false, {})`.
#[async_trait]
pub trait ProcessCallback: Send + Sync {
    async fn process(&self, document: &Document) -> Result<(bool, Document)>;
}

/// How a worker dispatches handlers for the events it consumes.
#[derive(Clone, Copy, Debug, Default)]
pub enum DispatchPolicy {
    /// Await each handler before pulling the next event; strict ordering.
    #[default]
    Serial,
    /// Run up to `n` handlers concurrently behind a semaphore, mirroring
    /// `ProcessPool`'s concurrency control.
    BoundedPool(usize),
}

impl DispatchPolicy {
    fn pool_width(self) -> usize {
        match self {
            DispatchPolicy::Serial => 1,
            DispatchPolicy::BoundedPool(n) if n > 0 => n,
            DispatchPolicy::BoundedPool(_) => DEFAULT_POOL_WIDTH,
        }
    }
}

struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// One change-stream consumer: subscribes, dispatches per-event handlers,
/// and owns its own lifecycle and reconnection.
pub struct Worker {
    name: String,
    match_doc: Document,
    repository: Arc<dyn Repository>,
    acknowledge: Arc<dyn AcknowledgeCallback>,
    process: Arc<dyn ProcessCallback>,
    policy: DispatchPolicy,
    shutdown: Arc<ShutdownSignal>,
    state: State,
    consumer: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        match_doc: Document,
        repository: Arc<dyn Repository>,
        acknowledge: Arc<dyn AcknowledgeCallback>,
        process: Arc<dyn ProcessCallback>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            match_doc,
            repository,
            acknowledge,
            process,
            policy,
            shutdown: Arc::new(ShutdownSignal::new()),
            state: State::Idle,
            consumer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moves Idle -> Running and spawns the consumer task.
    pub fn start(&mut self, resume: bool) {
        if self.state != State::Idle {
            warn!(worker = %self.name, "start called on a worker that isn't idle, ignoring");
            return;
        }

        let loop_state = ConsumerLoop {
            name: self.name.clone(),
            match_doc: self.match_doc.clone(),
            repository: self.repository.clone(),
            acknowledge: self.acknowledge.clone(),
            process: self.process.clone(),
            policy: self.policy,
            shutdown: self.shutdown.clone(),
        };

        self.consumer = Some(tokio::spawn(async move {
            loop_state.run(resume).await;
        }));
        self.state = State::Running;
        info!(worker = %self.name, "worker started");
    }

    /// Signals shutdown, waits up to the grace period for outstanding work,
    /// then abandons (never aborts) whatever is still running.
    pub async fn stop(&mut self) {
        if self.state != State::Running {
            self.state = State::Stopped;
            return;
        }

        self.state = State::Draining;
        self.shutdown.request();

        if let Some(handle) = self.consumer.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker = %self.name, error = %e, "consumer task panicked"),
                Err(_) => {
                    warn!(
                        worker = %self.name,
                        "shutdown grace period elapsed, abandoning outstanding handlers"
                    );
                }
            }
        }

        self.state = State::Stopped;
        info!(worker = %self.name, "worker stopped");
    }
}

/// The state the spawned consumer task actually runs against; split out of
/// [`Worker`] so it can be moved into the task body independent of `&mut
/// self`.
struct ConsumerLoop {
    name: String,
    match_doc: Document,
    repository: Arc<dyn Repository>,
    acknowledge: Arc<dyn AcknowledgeCallback>,
    process: Arc<dyn ProcessCallback>,
    policy: DispatchPolicy,
    shutdown: Arc<ShutdownSignal>,
}

impl ConsumerLoop {
    async fn run(&self, mut resume: bool) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.shutdown.is_requested() {
                return;
            }

            let stream = match self.repository.watch(self.match_doc.clone(), resume).await {
                Ok(stream) => {
                    backoff = INITIAL_BACKOFF;
                    stream
                }
                Err(ProcessingError::ChangeStream(e)) if is_resumable(&e) => {
                    warn!(worker = %self.name, error = %e, backoff_secs = backoff.as_secs(), "failed to open change stream, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    continue;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "non-resumable error opening change stream, worker stopping");
                    return;
                }
            };

            match self.consume(stream).await {
                Ok(()) => return, // shutdown requested mid-stream
                Err(ProcessingError::ChangeStream(e)) if is_resumable(&e) => {
                    warn!(worker = %self.name, error = %e, backoff_secs = backoff.as_secs(), "change stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    resume = true;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "non-resumable change stream error, worker stopping");
                    return;
                }
            }
        }
    }

    /// Drives events from an open stream until it ends, errors, or shutdown
    /// is requested. Returns `Ok(())` only on a clean shutdown.
    async fn consume(
        &self,
        mut stream: BoxStream<'static, Result<mongodb::change_stream::event::ChangeStreamEvent<Document>>>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.policy.pool_width()));
        let mut handlers: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            if self.shutdown.is_requested() {
                return self.drain(handlers).await;
            }

            let event = tokio::select! {
                biased;
                _ = self.shutdown.notify.notified() => {
                    if self.shutdown.is_requested() {
                        return self.drain(handlers).await;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProcessingError::Database(format!(
                        "change stream for worker \"{}\" closed unexpectedly",
                        self.name
                    )))
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(worker = %self.name, "handler semaphore closed unexpectedly, abandoning event");
                    return self.drain(handlers).await;
                }
            };
            let handler = Handler {
                name: self.name.clone(),
                repository: self.repository.clone(),
                acknowledge: self.acknowledge.clone(),
                process: self.process.clone(),
            };

            match self.policy {
                DispatchPolicy::Serial => {
                    handler.handle(event).await;
                    drop(permit);
                }
                DispatchPolicy::BoundedPool(_) => {
                    handlers.push(tokio::spawn(async move {
                        handler.handle(event).await;
                        drop(permit);
                    }));
                    // Reap finished handlers so the vec doesn't grow unbounded.
                    handlers.retain(|h| !h.is_finished());
                }
            }
        }
    }

    /// Waits up to the shutdown grace period for outstanding handler tasks,
    /// then drops whatever `JoinHandle`s remain. Dropping a `JoinHandle`
    /// (unlike aborting it) leaves the underlying task running to
    /// completion in the background — this is the "abandon, never kill"
    /// contract.
    async fn drain(&self, handlers: Vec<tokio::task::JoinHandle<()>>) -> Result<()> {
        if handlers.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE_PERIOD;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, futures::future::join_all(handlers))
            .await
            .is_err()
        {
            warn!(
                worker = %self.name,
                "shutdown grace period elapsed with handlers still running, abandoning them"
            );
        }
        Ok(())
    }
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * BACKOFF_MULTIPLIER, MAX_BACKOFF)
}

/// Executes the acknowledge/process cycle for a single event and writes the
/// resulting status, regardless of dispatch policy.
struct Handler {
    name: String,
    repository: Arc<dyn Repository>,
    acknowledge: Arc<dyn AcknowledgeCallback>,
    process: Arc<dyn ProcessCallback>,
}

impl Handler {
    async fn handle(&self, event: mongodb::change_stream::event::ChangeStreamEvent<Document>) {
        let Some(document) = event.full_document.as_ref() else {
            self.repository.save_resume_token(&event).await;
            return;
        };

        let Some(doc_id) = document.get("_id").cloned() else {
            warn!(worker = %self.name, "event document has no _id, skipping");
            self.repository.save_resume_token(&event).await;
            return;
        };

        if self.already_running(document) {
            warn!(worker = %self.name, document_id = %doc_id, "process already running for this document, skipping");
            self.repository.save_resume_token(&event).await;
            return;
        }

        let should_run = match self.acknowledge.acknowledge(document).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "acknowledge callback failed");
                false
            }
        };

        if should_run {
            self.run_process(&doc_id, document).await;
        }

        self.repository.save_resume_token(&event).await;
    }

    fn already_running(&self, document: &Document) -> bool {
        document
            .get_document(&self.name)
            .ok()
            .and_then(|subtree| subtree.get_bool("isRunning").ok())
            .unwrap_or(false)
    }

    async fn run_process(&self, doc_id: &Bson, document: &Document) {
        if let Err(e) = self.repository.start_process(doc_id, &self.name, &[]).await {
            error!(worker = %self.name, document_id = %doc_id, error = %e, "failed to write start_process marker");
            return;
        }

        let (success, results) = match self.process.process(document).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(worker = %self.name, document_id = %doc_id, error = %e, "process callback failed");
                (false, Document::new())
            }
        };

        if let Err(e) = self
            .repository
            .end_process(doc_id, &self.name, success, results, &[])
            .await
        {
            error!(worker = %self.name, document_id = %doc_id, error = %e, "failed to write end_process marker");
        }
    }
}
