//! Deduplicating, awaitable task queue.
//!
//! Every task has a dedup key. While a task is pending or running, enqueueing
//! the same key joins it instead of starting a second execution; all joiners
//! observe the one result. Completion removes the key before publishing the
//! result, so a failed task never blocks the next attempt.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use vault_protocol::ConfigKind;
use vault_protocol::api::TaskSource;

use crate::engine::PollCycle;
use crate::publisher::PublishResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Publish(ConfigKind),
    PublishAll,
    PublishForTenant(String),
    PollFleet,
}

impl Task {
    pub fn dedup_key(&self) -> String {
        match self {
            Task::Publish(kind) => format!("publish:{kind}"),
            Task::PublishAll => "publish-all".into(),
            Task::PublishForTenant(tenant) => format!("publish-tenant:{tenant}"),
            Task::PollFleet => "poll-fleet".into(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dedup_key())
    }
}

#[derive(Debug, Clone)]
pub enum TaskOutput {
    Published(Vec<PublishResult>),
    Polled(Box<PollCycle>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    /// Surfaced to operators; never retried silently.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("task aborted before completing")]
    Aborted,
}

pub type TaskResult = Result<TaskOutput, TaskError>;

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Run one task. `scheduler` lets a task enqueue and await subtasks.
    async fn execute(&self, task: Task, scheduler: TaskScheduler) -> TaskResult;
}

struct InFlight {
    id: u64,
    source: TaskSource,
    rx: watch::Receiver<Option<TaskResult>>,
}

struct Inner {
    executor: Arc<dyn TaskExecutor>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

/// Returned by [`TaskScheduler::enqueue`]. Dropping it is fire-and-forget;
/// [`TaskHandle::wait`] blocks until the shared execution finishes.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: u64,
    pub key: String,
    /// False when the call joined a task already pending or running.
    pub created: bool,
    /// Source of the execution this handle observes.
    pub source: TaskSource,
    rx: watch::Receiver<Option<TaskResult>>,
}

impl TaskHandle {
    pub async fn wait(self) -> TaskResult {
        let mut rx = self.rx;
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Err(TaskError::Aborted)),
            Err(_) => Err(TaskError::Aborted),
        }
    }
}

impl TaskScheduler {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start `task`, or join the execution already running under its key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, task: Task, source: TaskSource) -> TaskHandle {
        let key = task.dedup_key();
        let mut map = self.lock_map();
        if let Some(existing) = map.get(&key) {
            tracing::debug!(%key, %source, joined = existing.id, "joined in-flight task");
            return TaskHandle {
                id: existing.id,
                key,
                created: false,
                source: existing.source,
                rx: existing.rx.clone(),
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        map.insert(
            key.clone(),
            InFlight {
                id,
                source,
                rx: rx.clone(),
            },
        );
        drop(map);
        tracing::debug!(%key, %source, id, "task started");

        let guard = Completion {
            scheduler: self.clone(),
            key: key.clone(),
            id,
            tx: Some(tx),
        };
        let scheduler = self.clone();
        let executor = self.inner.executor.clone();
        tokio::spawn(async move {
            let mut guard = guard;
            let result = executor.execute(task, scheduler).await;
            match &result {
                Err(TaskError::Fatal(msg)) => {
                    tracing::error!(key = %guard.key, %source, "task failed fatally: {msg}")
                }
                Err(err) => tracing::warn!(key = %guard.key, %source, "task failed: {err}"),
                Ok(_) => tracing::debug!(key = %guard.key, %source, "task finished"),
            }
            guard.complete(result);
        });

        TaskHandle {
            id,
            key,
            created: true,
            source,
            rx,
        }
    }

    /// Keys currently pending or running.
    pub fn in_flight(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock_map().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        // The map is only touched by short critical sections above.
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, key: &str, id: u64) {
        let mut map = self.lock_map();
        if map.get(key).is_some_and(|entry| entry.id == id) {
            map.remove(key);
        }
    }
}

/// Releases the dedup key and delivers the result, also when the executing
/// future panics or is dropped.
struct Completion {
    scheduler: TaskScheduler,
    key: String,
    id: u64,
    tx: Option<watch::Sender<Option<TaskResult>>>,
}

impl Completion {
    fn complete(&mut self, result: TaskResult) {
        self.scheduler.release(&self.key, self.id);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.complete(Err(TaskError::Aborted));
        }
    }
}
