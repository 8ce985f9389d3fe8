//! Storage-backed priority task queue.
//!
//! A [`Queue`] owns a bounded in-memory buffer fed by a poller that claims
//! eligible tasks from a [`TaskStore`], and a fixed pool of workers that run
//! each task through its registered [`TaskHandler`]:
//!
//! - success deletes the task
//! - a transient error reschedules it with exponential backoff
//! - a permanent error, a missing handler, or an exhausted retry budget
//!   moves it to the failure log
//!
//! Without a store the queue is memory-only: pushed tasks go straight to the
//! buffer and retries are re-sent after their delay.

pub mod registry;
pub mod retry;
pub mod task;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::storage::{FailedTask, TaskStore};
use crate::{Error, ErrorKind, now_unix};

pub use registry::{Registry, TaskHandler};
pub use retry::backoff;
pub use task::{PRIORITY_BATCH, PRIORITY_DEFAULT, PRIORITY_INTERACTIVE, Task};

/// Queue tuning, usually taken from [`QueueConfig`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub workers: usize,
    pub buffer_size: usize,
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub polling: bool,
    pub retry_max: u32,
    pub max_backoff_minutes: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            workers: config.workers,
            buffer_size: config.buffer_size,
            lock_duration: config.lock_duration(),
            poll_interval: config.poll_interval(),
            polling: config.polling,
            retry_max: config.retry_max,
            max_backoff_minutes: config.max_backoff_minutes,
        }
    }
}

/// What happened to a task after one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Rescheduled { retry_count: u32, start_date: i64 },
    Failed,
}

/// Priority task queue.
///
/// Created before its handlers exist so that handlers may hold a reference
/// back to it; [`Queue::start`] installs the registry and spawns the workers.
pub struct Queue {
    options: QueueOptions,
    store: Option<Arc<dyn TaskStore>>,
    registry: OnceLock<Arc<Registry>>,
    tx: mpsc::Sender<Task>,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("options", &self.options)
            .field("persistent", &self.store.is_some())
            .field("registry", &self.registry.get())
            .finish()
    }
}

impl Queue {
    pub fn new(options: QueueOptions, store: Option<Arc<dyn TaskStore>>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        Arc::new(Self { options, store, registry: OnceLock::new(), tx, rx: Arc::new(Mutex::new(rx)) })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> Option<&Arc<dyn TaskStore>> {
        self.store.as_ref()
    }

    /// Install the handler registry and spawn workers plus, when a store is
    /// configured and polling is enabled, the storage poller.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the queue was already started.
    pub fn start(self: &Arc<Self>, registry: Registry) -> Result<QueueHandle, Error> {
        self.registry
            .set(Arc::new(registry))
            .map_err(|_| Error::InvalidInput("queue already started".into()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.options.workers + 1);

        for worker_id in 0..self.options.workers {
            let queue = Arc::clone(self);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { queue.worker_loop(worker_id, rx).await }));
        }

        if let Some(store) = self.store.clone().filter(|_| self.options.polling) {
            let queue = Arc::clone(self);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { queue.poll_loop(store, rx).await }));
        }

        tracing::info!(
            workers = self.options.workers,
            polling = self.store.is_some() && self.options.polling,
            "task queue started"
        );

        Ok(QueueHandle { shutdown_tx, joins })
    }

    /// Enqueue a task.
    ///
    /// With a store the task is persisted and picked up by the poller; a task
    /// whose signature matches a queued one is collapsed into it.
    pub async fn push(&self, mut task: Task) -> Result<(), Error> {
        task.retry_max.get_or_insert(self.options.retry_max);

        match &self.store {
            Some(store) => {
                if store.insert_task(&task).await? {
                    tracing::debug!(task = %task.name, task_id = %task.task_id, "task queued");
                } else {
                    tracing::debug!(task = %task.name, signature = ?task.signature, "duplicate task collapsed");
                }
                Ok(())
            }
            None => self.send_later(task),
        }
    }

    /// Run the task's handler right away in the caller's task, queueing it
    /// for retry only if the handler fails. A task without a handler goes
    /// to the failure log.
    pub async fn push_inline(&self, mut task: Task) -> Result<Outcome, Error> {
        task.retry_max.get_or_insert(self.options.retry_max);

        let handler = self.registry.get().and_then(|registry| registry.get(&task.name)).cloned();
        let Some(handler) = handler else {
            let err = Error::HandlerNotFound(task.name.clone());
            return Ok(self.settle(task, Err(err)).await);
        };

        let result = handler.handle(&task).await;
        let Err(err) = result else {
            return Ok(Outcome::Completed);
        };

        if err.is_retryable() && !retries_exhausted(&task) {
            self.schedule_retry(&mut task, &err);
            self.push(task.clone()).await?;
            return Ok(Outcome::Rescheduled { retry_count: task.retry_count, start_date: task.start_date });
        }
        Ok(self.settle(task, Err(err)).await)
    }

    /// Most recent permanent failures, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageMissing` for a memory-only queue.
    pub async fn failures(&self, limit: usize) -> Result<Vec<FailedTask>, Error> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::StorageMissing("failure log needs a task store".into()))?;
        store.failures(limit).await
    }

    /// Execute one task and record the result.
    pub async fn process(&self, task: Task) -> Outcome {
        let handler = self.registry.get().and_then(|registry| registry.get(&task.name)).cloned();

        let result = match handler {
            Some(handler) => handler.handle(&task).await,
            None => Err(Error::HandlerNotFound(task.name.clone())),
        };

        self.settle(task, result).await
    }

    async fn settle(&self, mut task: Task, result: Result<(), Error>) -> Outcome {
        let err = match result {
            Ok(()) => {
                self.delete(&task).await;
                return Outcome::Completed;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(task = %task.name, error = %err, "task target not found, dropping");
                self.delete(&task).await;
                return Outcome::Completed;
            }
            Err(err) => err,
        };

        if is_permanent(&err) || retries_exhausted(&task) {
            self.fail(&task, &err).await;
            return Outcome::Failed;
        }

        self.schedule_retry(&mut task, &err);
        tracing::debug!(
            task = %task.name,
            retry_count = task.retry_count,
            start_date = task.start_date,
            error = %err,
            "task rescheduled"
        );
        let outcome = Outcome::Rescheduled { retry_count: task.retry_count, start_date: task.start_date };

        match &self.store {
            Some(store) => {
                if let Err(e) = store.update_task(&task).await {
                    tracing::warn!(task = %task.name, error = %e, "failed to reschedule task");
                }
            }
            None => {
                if let Err(e) = self.send_later(task) {
                    tracing::warn!(error = %e, "failed to reschedule task");
                }
            }
        }
        outcome
    }

    fn schedule_retry(&self, task: &mut Task, err: &Error) {
        task.retry_count += 1;
        let delay = err
            .retry_after()
            .unwrap_or_else(|| backoff(task.retry_count, self.options.max_backoff_minutes));
        task.start_date = now_unix() + delay.as_secs() as i64;
        task.timeout_date = task.start_date;
        task.lock_id.clear();
        task.error = err.to_string();
    }

    async fn delete(&self, task: &Task) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete_task(&task.task_id).await {
            tracing::warn!(task = %task.name, error = %e, "failed to delete finished task");
        }
    }

    async fn fail(&self, task: &Task, err: &Error) {
        tracing::error!(
            task = %task.name,
            task_id = %task.task_id,
            retry_count = task.retry_count,
            error = %err,
            "task failed permanently"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.log_failure(task, &err.to_string()).await {
                tracing::warn!(task = %task.name, error = %e, "failed to record task failure");
            }
            self.delete(task).await;
        }
    }

    /// Buffer a task directly, after its start date when that is in the future.
    fn send_later(&self, task: Task) -> Result<(), Error> {
        let delay = task.delay_from(now_unix());
        if delay.is_zero() {
            return self
                .tx
                .try_send(task)
                .map_err(|e| Error::QueueUnavailable(format!("buffer rejected task: {e}")));
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(task).await {
                tracing::warn!(task = %e.0.name, "queue closed before delayed task was buffered");
            }
        });
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if stopping(&shutdown) {
                break;
            }

            let task = tokio::select! {
                _ = shutdown.changed() => continue,
                task = async { self.rx.lock().await.recv().await } => task,
            };

            let Some(task) = task else {
                break;
            };

            tracing::trace!(worker_id, task = %task.name, "processing task");
            self.process(task).await;
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn poll_loop(self: Arc<Self>, store: Arc<dyn TaskStore>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if stopping(&shutdown) {
                break;
            }

            let found = match self.poll_once(store.as_ref(), &mut shutdown).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "task poll failed");
                    0
                }
            };

            if found == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }
        tracing::debug!("task poller stopped");
    }

    /// Claim one batch of eligible tasks and hand it to the workers.
    async fn poll_once(&self, store: &dyn TaskStore, shutdown: &mut watch::Receiver<bool>) -> Result<usize, Error> {
        let limit = self.options.buffer_size.min(self.tx.capacity());
        if limit == 0 {
            return Ok(0);
        }

        let lock_id = ulid::Ulid::new().to_string();
        let now = now_unix();
        let timeout_date = now + self.options.lock_duration.as_secs() as i64;

        if store.lock_tasks(&lock_id, now, timeout_date, limit).await? == 0 {
            return Ok(0);
        }

        let tasks = store.locked_tasks(&lock_id).await?;
        let found = tasks.len();
        for task in tasks {
            tokio::select! {
                _ = shutdown.changed() => return Ok(found),
                sent = self.tx.send(task) => {
                    if sent.is_err() {
                        return Err(Error::QueueUnavailable("work buffer closed".into()));
                    }
                }
            }
        }
        Ok(found)
    }
}

/// Shutdown was requested, or the handle holding the sender is gone.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn is_permanent(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::Client | ErrorKind::Internal)
}

fn retries_exhausted(task: &Task) -> bool {
    task.retry_count >= task.retry_max.unwrap_or(0)
}

/// Running queue; stops the workers and the poller when shut down or dropped.
pub struct QueueHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl QueueHandle {
    /// Ask workers and the poller to stop after their current task.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every worker and the poller.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}
