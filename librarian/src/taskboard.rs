//! An async job queue for long-running analyses.
//!
//! Grounded in the `tokio::sync::mpsc` + `tokio::spawn` pattern the teacher
//! uses for its own long-running `index` tool call, generalized into a
//! small fixed worker pool with priority dequeue, per-task-type timeouts,
//! and cooperative cancellation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::error::{ErrorKind, LibrarianError, LibrarianResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

struct TaskRecord {
    task_type: String,
    parameters: serde_json::Value,
    priority: Priority,
    status: TaskStatus,
    submitted_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    cancel_requested: Arc<AtomicBool>,
}

impl TaskRecord {
    fn snapshot(&self, id: &str) -> TaskSnapshot {
        TaskSnapshot {
            id: id.to_string(),
            task_type: self.task_type.clone(),
            priority: self.priority,
            status: self.status,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_requested: self.cancel_requested.load(Ordering::SeqCst),
        }
    }
}

/// Cooperative cancellation handle passed to handlers. Handlers are
/// expected to poll this periodically during long work.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = LibrarianResult<serde_json::Value>> + Send>>;
pub type TaskHandler = Arc<dyn Fn(serde_json::Value, CancelToken) -> HandlerFuture + Send + Sync>;

struct QueueItem {
    priority: Priority,
    sequence: u64,
    task_id: String,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueItem {}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; among equal priorities, earlier submission
        // (lower sequence) first -> invert sequence comparison for a max-heap.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Inner {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    queue: std::sync::Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    handlers: HashMap<String, TaskHandler>,
    default_timeouts: HashMap<String, Duration>,
    fallback_timeout: Duration,
    sequence: AtomicU64,
    stop: AtomicBool,
}

/// A handle to the shared queue/worker-pool state. Clone freely; every
/// clone refers to the same tasks.
#[derive(Clone)]
pub struct TaskBoard {
    inner: Arc<Inner>,
}

impl TaskBoard {
    pub fn new(fallback_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                queue: std::sync::Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                handlers: HashMap::new(),
                default_timeouts: HashMap::new(),
                fallback_timeout,
                sequence: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Register a handler for `task_type`, used by a builder-style setup at
    /// process startup (handlers are fixed for the process lifetime).
    pub fn with_handler(mut self, task_type: impl Into<String>, handler: TaskHandler) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("handlers must be registered before cloning the board")
            .handlers
            .insert(task_type.into(), handler);
        self
    }

    pub fn with_timeout(mut self, task_type: impl Into<String>, timeout: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("timeouts must be registered before cloning the board")
            .default_timeouts
            .insert(task_type.into(), timeout);
        self
    }

    /// Spawn `workers` worker loops. Each runs until [`TaskBoard::shutdown`]
    /// is called.
    pub fn spawn_workers(&self, workers: usize) {
        for _ in 0..workers.max(1) {
            let board = self.clone();
            tokio::spawn(async move { board.worker_loop().await });
        }
    }

    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        parameters: serde_json::Value,
        priority: Priority,
    ) -> LibrarianResult<String> {
        let task_type = task_type.into();
        if !self.inner.handlers.contains_key(&task_type) {
            return Err(LibrarianError::unknown_task_type(&task_type));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let record = TaskRecord {
            task_type: task_type.clone(),
            parameters,
            priority,
            status: TaskStatus::Pending,
            submitted_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        };
        self.inner.tasks.write().await.insert(id.clone(), record);

        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        self.inner.queue.lock().unwrap().push(QueueItem {
            priority,
            sequence,
            task_id: id.clone(),
        });
        self.inner.notify.notify_one();
        Ok(id)
    }

    pub async fn status(&self, task_id: &str) -> LibrarianResult<TaskSnapshot> {
        let tasks = self.inner.tasks.read().await;
        let record = tasks
            .get(task_id)
            .ok_or_else(|| LibrarianError::not_found(format!("no such task: {task_id}")))?;
        Ok(record.snapshot(task_id))
    }

    pub async fn result(&self, task_id: &str) -> LibrarianResult<TaskSnapshot> {
        self.status(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> LibrarianResult<TaskSnapshot> {
        let mut tasks = self.inner.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| LibrarianError::not_found(format!("no such task: {task_id}")))?;
        match record.status {
            TaskStatus::Pending => {
                record.status = TaskStatus::Cancelled;
                record.ended_at = Some(chrono::Utc::now());
            }
            TaskStatus::Running => {
                record.cancel_requested.store(true, Ordering::SeqCst);
            }
            _ => {
                // Terminal states are final: cancelling a finished task is a no-op.
            }
        }
        Ok(record.snapshot(task_id))
    }

    pub async fn list(&self, status: Option<TaskStatus>, task_type: Option<&str>) -> Vec<TaskSnapshot> {
        let tasks = self.inner.tasks.read().await;
        let mut out: Vec<_> = tasks
            .iter()
            .filter(|(_, r)| status.is_none_or(|s| r.status == s))
            .filter(|(_, r)| task_type.is_none_or(|t| r.task_type == t))
            .map(|(id, r)| r.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        out
    }

    async fn worker_loop(&self) {
        loop {
            if self.inner.stop.load(Ordering::SeqCst) {
                return;
            }
            let next = self.inner.queue.lock().unwrap().pop();
            let Some(item) = next else {
                tokio::select! {
                    _ = self.inner.notify.notified() => {},
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {},
                }
                continue;
            };
            self.run_one(item.task_id).await;
        }
    }

    async fn run_one(&self, task_id: String) {
        let (handler, parameters, cancel_requested, timeout) = {
            let mut tasks = self.inner.tasks.write().await;
            let Some(record) = tasks.get_mut(&task_id) else {
                return;
            };
            if record.status != TaskStatus::Pending {
                // Cancelled while queued.
                return;
            }
            record.status = TaskStatus::Running;
            record.started_at = Some(chrono::Utc::now());
            let handler = self.inner.handlers.get(&record.task_type).cloned();
            let timeout = self
                .inner
                .default_timeouts
                .get(&record.task_type)
                .copied()
                .unwrap_or(self.inner.fallback_timeout);
            (
                handler,
                record.parameters.clone(),
                record.cancel_requested.clone(),
                timeout,
            )
        };

        let Some(handler) = handler else {
            self.finish(&task_id, TaskStatus::Failed, None, Some("handler vanished".into()))
                .await;
            return;
        };

        let token = CancelToken(cancel_requested.clone());
        let future = handler(parameters, token);
        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(value)) => {
                if cancel_requested.load(Ordering::SeqCst) {
                    self.finish(&task_id, TaskStatus::Cancelled, None, None).await;
                } else {
                    self.finish(&task_id, TaskStatus::Completed, Some(value), None).await;
                }
            }
            Ok(Err(e)) => {
                let status = if e.kind == ErrorKind::Cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                self.finish(&task_id, status, None, Some(e.message)).await;
            }
            Err(_) => {
                self.finish(&task_id, TaskStatus::Timeout, None, Some("task exceeded its time budget".into()))
                    .await;
            }
        }
    }

    async fn finish(&self, task_id: &str, status: TaskStatus, result: Option<serde_json::Value>, error: Option<String>) {
        let mut tasks = self.inner.tasks.write().await;
        if let Some(record) = tasks.get_mut(task_id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.result = result;
            record.error = error;
            record.ended_at = Some(chrono::Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> TaskHandler {
        Arc::new(|_params, _cancel| Box::pin(async { Ok(serde_json::json!({"ok": true})) }))
    }

    #[tokio::test]
    async fn unknown_task_type_rejected_at_submit() {
        let board = TaskBoard::new(Duration::from_secs(5));
        let err = board
            .submit("mystery", serde_json::Value::Null, Priority::Medium)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownTaskType);
    }

    #[tokio::test]
    async fn high_priority_dequeues_before_low() {
        let board = TaskBoard::new(Duration::from_secs(5)).with_handler("noop", noop_handler());
        board.spawn_workers(1);

        let low_id = board.submit("noop", serde_json::Value::Null, Priority::Low).await.unwrap();
        let high_id = board.submit("noop", serde_json::Value::Null, Priority::High).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let high_status = board.status(&high_id).await.unwrap();
        let low_status = board.status(&low_id).await.unwrap();
        assert_eq!(high_status.status, TaskStatus::Completed);
        // Both should complete quickly with a single fast worker; what matters
        // is that high was not starved. At minimum it must be terminal.
        assert!(low_status.status.is_terminal() || low_status.status == TaskStatus::Pending);
        board.shutdown();
    }

    #[tokio::test]
    async fn cancel_completed_task_is_noop() {
        let board = TaskBoard::new(Duration::from_secs(5)).with_handler("noop", noop_handler());
        board.spawn_workers(1);
        let id = board.submit("noop", serde_json::Value::Null, Priority::Medium).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(board.status(&id).await.unwrap().status, TaskStatus::Completed);

        let snapshot = board.cancel(&id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        board.shutdown();
    }

    #[tokio::test]
    async fn timeout_marks_task_timeout() {
        let handler: TaskHandler = Arc::new(|_params, _cancel| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(serde_json::Value::Null)
            })
        });
        let board = TaskBoard::new(Duration::from_secs(5)).with_handler("slow", handler).with_timeout("slow", Duration::from_millis(50));
        board.spawn_workers(1);
        let id = board.submit("slow", serde_json::Value::Null, Priority::Medium).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board.status(&id).await.unwrap().status, TaskStatus::Timeout);
        board.shutdown();
    }
}
