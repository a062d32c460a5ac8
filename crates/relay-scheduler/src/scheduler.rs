// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task {0} timed out")]
    Timeout(String),
    #[error("task {0} was cancelled")]
    Cancelled(String),
    #[error("task {id} failed: {message}")]
    Failed { id: String, message: String },
    #[error("invalid task state: {0}")]
    InvalidState(String),
}

/// Cooperative cancellation flag handed to task payloads that want to
/// observe cancellation mid-flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;

struct TaskState {
    id: String,
    priority: TaskPriority,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
    cancel: CancelFlag,
    /// Taken exactly once when execution begins.
    future: Option<TaskFuture>,
}

impl TaskState {
    fn execution_time(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }
}

/// Point-in-time snapshot of one task's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: usize,
    pub pending: usize,
    pub total_tasks: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct Counters {
    scheduled: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

struct Inner {
    tasks: HashMap<String, Arc<Mutex<TaskState>>>,
    /// `(priority, id)` pairs awaiting execution, kept sorted by priority
    /// descending; the sort is stable so equal priorities preserve
    /// submission order.
    pending: Vec<(TaskPriority, String)>,
    counter: u64,
}

/// Bounded-parallel task pool.
///
/// A counting semaphore of capacity `max_concurrent` caps in-flight
/// payloads; at every moment the number of Running tasks is ≤ that bound.
/// Higher-priority pending tasks begin no later than lower-priority ones;
/// completion order is not guaranteed.
pub struct Scheduler {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    inner: Mutex<Inner>,
    counters: Mutex<Counters>,
    running: AtomicUsize,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        info!(max_concurrent = cfg.max_concurrent, "scheduler initialized");
        Self {
            max_concurrent: cfg.max_concurrent,
            semaphore: Arc::new(Semaphore::new(cfg.max_concurrent)),
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                pending: Vec::new(),
                counter: 0,
            }),
            counters: Mutex::new(Counters::default()),
            running: AtomicUsize::new(0),
        }
    }

    /// Place a task on the pending list.  Returns the task id and the
    /// cooperative cancel flag the payload may poll.
    pub fn schedule<F>(
        &self,
        future: F,
        priority: TaskPriority,
        id: Option<String>,
    ) -> (String, CancelFlag)
    where
        F: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("scheduler lock");
        let id = id.unwrap_or_else(|| {
            let id = format!("task_{}", inner.counter);
            inner.counter += 1;
            id
        });
        let cancel = CancelFlag::default();
        let state = TaskState {
            id: id.clone(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cancel: cancel.clone(),
            future: Some(Box::pin(future)),
        };
        inner.tasks.insert(id.clone(), Arc::new(Mutex::new(state)));
        inner.pending.push((priority, id.clone()));
        // Stable sort: equal-priority tasks keep submission order.
        inner.pending.sort_by(|a, b| b.0.cmp(&a.0));

        self.counters.lock().expect("counter lock").scheduled += 1;
        debug!(task_id = %id, ?priority, queue = inner.pending.len(), "task scheduled");
        (id, cancel)
    }

    /// Execute one task under the concurrency bound.
    pub async fn execute_task(&self, id: &str) -> Result<Value, SchedulerError> {
        let task = self
            .task_arc(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        let future = {
            let mut state = task.lock().expect("task lock");
            if state.status == TaskStatus::Cancelled {
                return Err(SchedulerError::Cancelled(id.to_string()));
            }
            state
                .future
                .take()
                .ok_or_else(|| SchedulerError::InvalidState(format!("task {id} already ran")))?
        };

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::InvalidState("semaphore closed".into()))?;

        {
            let mut state = task.lock().expect("task lock");
            // A cancel may have landed while waiting for a permit.
            if state.status == TaskStatus::Cancelled {
                drop(permit);
                return Err(SchedulerError::Cancelled(id.to_string()));
            }
            state.status = TaskStatus::Running;
            state.started_at = Some(Utc::now());
        }
        self.running.fetch_add(1, Ordering::SeqCst);
        debug!(
            task_id = %id,
            running = self.running.load(Ordering::SeqCst),
            max = self.max_concurrent,
            "task started"
        );

        let outcome = future.await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let mut state = task.lock().expect("task lock");
        state.completed_at = Some(Utc::now());
        if state.status == TaskStatus::Cancelled {
            // Cancelled while running; discard the outcome.
            return Err(SchedulerError::Cancelled(id.to_string()));
        }
        match outcome {
            Ok(value) => {
                state.result = Some(value.clone());
                state.status = TaskStatus::Completed;
                self.counters.lock().expect("counter lock").completed += 1;
                debug!(task_id = %id, elapsed = ?state.execution_time(), "task completed");
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                state.error = Some(message.clone());
                state.status = TaskStatus::Failed;
                self.counters.lock().expect("counter lock").failed += 1;
                warn!(task_id = %id, error = %message, "task failed");
                Err(SchedulerError::Failed {
                    id: id.to_string(),
                    message,
                })
            }
        }
    }

    /// Run the given tasks in parallel through [`execute_task`], preserving
    /// submission order in the returned list.  With `return_exceptions` the
    /// per-task errors become `Err` elements; otherwise the first error is
    /// propagated.
    ///
    /// [`execute_task`]: Scheduler::execute_task
    pub async fn execute_batch(
        &self,
        ids: &[String],
        return_exceptions: bool,
    ) -> Result<Vec<Result<Value, SchedulerError>>, SchedulerError> {
        debug!(count = ids.len(), "executing batch");
        let jobs: Vec<_> = ids.iter().map(|id| self.execute_task(id)).collect();
        let results = futures::future::join_all(jobs).await;
        if !return_exceptions {
            if let Some(pos) = results.iter().position(|r| r.is_err()) {
                let mut results = results;
                return Err(results.remove(pos).unwrap_err());
            }
        }
        Ok(results)
    }

    /// Pop up to `max` pending tasks (all when unset) and execute them as a
    /// batch.  Results preserve the popped order.
    pub async fn execute_pending(
        &self,
        max: Option<usize>,
    ) -> Vec<Result<Value, SchedulerError>> {
        let ids: Vec<String> = {
            let mut inner = self.inner.lock().expect("scheduler lock");
            let take = max.unwrap_or(inner.pending.len()).min(inner.pending.len());
            inner.pending.drain(..take).map(|(_, id)| id).collect()
        };
        if ids.is_empty() {
            return Vec::new();
        }
        info!(count = ids.len(), "executing pending tasks");
        self.execute_batch(&ids, true)
            .await
            .unwrap_or_else(|e| vec![Err(e)])
    }

    /// Cancel a task.  Pending tasks are removed synchronously; running
    /// tasks get a cooperative cancellation request via their [`CancelFlag`].
    pub fn cancel_task(&self, id: &str) -> bool {
        // Lock ordering: registry before task state, matching every other
        // path that takes both.
        let mut inner = self.inner.lock().expect("scheduler lock");
        let task = match inner.tasks.get(id).cloned() {
            Some(t) => t,
            None => {
                warn!(task_id = %id, "cancel requested for unknown task");
                return false;
            }
        };
        let mut state = task.lock().expect("task lock");
        match state.status {
            TaskStatus::Pending => {
                inner.pending.retain(|(_, tid)| tid != id);
                state.status = TaskStatus::Cancelled;
                state.cancel.set();
                self.counters.lock().expect("counter lock").cancelled += 1;
                info!(task_id = %id, "pending task cancelled");
                true
            }
            TaskStatus::Running => {
                state.status = TaskStatus::Cancelled;
                state.cancel.set();
                self.counters.lock().expect("counter lock").cancelled += 1;
                info!(task_id = %id, "running task cancelled (cooperative)");
                true
            }
            _ => false,
        }
    }

    /// Wait for a task to reach a terminal state and return its result.
    /// `Err(Timeout)` after the deadline leaves the task live.
    pub async fn wait_for_task(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, SchedulerError> {
        let task = self
            .task_arc(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        // A still-pending task is pulled off the queue and run here.
        let is_pending = {
            let state = task.lock().expect("task lock");
            state.status == TaskStatus::Pending
        };
        if is_pending {
            {
                let mut inner = self.inner.lock().expect("scheduler lock");
                inner.pending.retain(|(_, tid)| tid != id);
            }
            return match timeout {
                Some(t) => tokio::time::timeout(t, self.execute_task(id))
                    .await
                    .map_err(|_| SchedulerError::Timeout(id.to_string()))?,
                None => self.execute_task(id).await,
            };
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let state = task.lock().expect("task lock");
                match state.status {
                    TaskStatus::Completed => {
                        return Ok(state.result.clone().unwrap_or(Value::Null))
                    }
                    TaskStatus::Failed => {
                        return Err(SchedulerError::Failed {
                            id: id.to_string(),
                            message: state.error.clone().unwrap_or_default(),
                        })
                    }
                    TaskStatus::Cancelled => {
                        return Err(SchedulerError::Cancelled(id.to_string()))
                    }
                    TaskStatus::Pending | TaskStatus::Running => {}
                }
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(SchedulerError::Timeout(id.to_string()));
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.task_arc(id)
            .map(|t| t.lock().expect("task lock").status)
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.task_arc(id).map(|t| {
            let s = t.lock().expect("task lock");
            TaskSnapshot {
                id: s.id.clone(),
                priority: s.priority,
                status: s.status,
                created_at: s.created_at,
                started_at: s.started_at,
                completed_at: s.completed_at,
                error: s.error.clone(),
            }
        })
    }

    pub fn running_tasks(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("scheduler lock");
        inner
            .tasks
            .values()
            .filter_map(|t| {
                let s = t.lock().expect("task lock");
                (s.status == TaskStatus::Running).then(|| s.id.clone())
            })
            .collect()
    }

    pub fn pending_tasks(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("scheduler lock")
            .pending
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Drop bookkeeping for tasks in a terminal state.
    pub fn clear_finished(&self) {
        let mut inner = self.inner.lock().expect("scheduler lock");
        inner.tasks.retain(|_, t| {
            let s = t.lock().expect("task lock");
            matches!(s.status, TaskStatus::Pending | TaskStatus::Running)
        });
    }

    pub fn stats(&self) -> SchedulerStats {
        let (pending, total) = {
            let inner = self.inner.lock().expect("scheduler lock");
            (inner.pending.len(), inner.tasks.len())
        };
        let c = self.counters.lock().expect("counter lock");
        SchedulerStats {
            scheduled: c.scheduled,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            running: self.running.load(Ordering::SeqCst),
            pending,
            total_tasks: total,
            max_concurrent: self.max_concurrent,
        }
    }

    fn task_arc(&self, id: &str) -> Option<Arc<Mutex<TaskState>>> {
        self.inner
            .lock()
            .expect("scheduler lock")
            .tasks
            .get(id)
            .cloned()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
