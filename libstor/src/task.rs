//! Asynchronous task handles and the scheduling/wait engine.
//!
//! A [`Task`] is the handle to one concurrently executing unit of work:
//! a process-unique id, a state machine (`Pending → Running → Succeeded |
//! Failed`), an opaque JSON result or a [`StorError`], and a completion
//! gate any number of waiters can block on.  [`TaskTracker`] launches work
//! functions as Tokio tasks, assigns monotonically increasing ids, and
//! registers every task for later waiting.
//!
//! # Thread safety
//!
//! The tracker's id counter is atomic and its registry is a [`DashMap`],
//! so scheduling and waiting may happen concurrently from any number of
//! Tokio tasks.  Completion is signalled through a [`watch`] channel, so a
//! waiter that arrives after the task reached a terminal state returns
//! immediately instead of blocking.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::context::{Context, ContextValue, Key};
use crate::error::StorError;

/// Process-unique, monotonically increasing task identifier.
pub type TaskId = u64;

/// Validator applied to a task's result immediately before the `Succeeded`
/// transition is committed; a validation error forces a `Failed` transition
/// instead.
pub type TaskValidator = Arc<dyn Fn(&Value) -> Result<(), StorError> + Send + Sync>;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Created but not yet started.
    Pending,
    /// The work function is executing.
    Running,
    /// The work function returned a result that passed validation.
    Succeeded,
    /// The work function returned an error, failed validation, or panicked.
    Failed,
}

impl TaskState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    result: Option<Value>,
    error: Option<StorError>,
}

/// Handle to one asynchronous unit of work.
///
/// Exactly one of `result`/`error` is set once the state is terminal;
/// terminal states are final and idempotent to observe.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    inner: RwLock<TaskInner>,
    state_tx: watch::Sender<TaskState>,
}

impl Task {
    fn new(id: TaskId) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TaskState::Pending);
        Arc::new(Self {
            id,
            inner: RwLock::new(TaskInner {
                state: TaskState::Pending,
                result: None,
                error: None,
            }),
            state_tx,
        })
    }

    /// The task's process-unique identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's current state.
    pub fn state(&self) -> TaskState {
        self.inner.read().expect("task state lock poisoned").state
    }

    /// The task's result, set only once the task has succeeded.
    pub fn result(&self) -> Option<Value> {
        self.inner
            .read()
            .expect("task state lock poisoned")
            .result
            .clone()
    }

    /// The task's error, set only once the task has failed.
    pub fn error(&self) -> Option<StorError> {
        self.inner
            .read()
            .expect("task state lock poisoned")
            .error
            .clone()
    }

    /// Block until the task reaches a terminal state.
    ///
    /// Returns immediately if it already has; any number of parties may
    /// wait on the same task and they all observe the same terminal state.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                // The sender lives inside the task itself, so this is
                // unreachable while a waiter holds the handle.
                return self.state();
            }
        }
    }

    fn transition(&self, state: TaskState, result: Option<Value>, error: Option<StorError>) {
        {
            let mut inner = self.inner.write().expect("task state lock poisoned");
            if inner.state.is_terminal() {
                warn!(task_id = self.id, from = %inner.state, to = %state,
                    "ignoring transition on terminal task");
                return;
            }
            inner.state = state;
            inner.result = result;
            inner.error = error;
        }
        self.state_tx.send_replace(state);
    }

    fn start(&self) {
        self.transition(TaskState::Running, None, None);
    }

    fn succeed(&self, result: Value) {
        self.transition(TaskState::Succeeded, Some(result), None);
    }

    fn fail(&self, error: StorError) {
        self.transition(TaskState::Failed, None, Some(error));
    }
}

/// Launches work functions as tracked, concurrently executing tasks.
///
/// Construction is explicit so tests can use a fresh tracker instead of
/// process-wide state; the [`ServiceRegistry`](crate::service::ServiceRegistry)
/// owns one tracker for the life of the process.
pub struct TaskTracker {
    next_id: AtomicU64,
    tasks: DashMap<TaskId, Arc<Task>>,
}

impl TaskTracker {
    /// Create an empty tracker with its id counter at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: DashMap::new(),
        }
    }

    /// Look up a task by id.
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    /// Number of tasks ever scheduled on this tracker.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task has been scheduled yet.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Schedule `run` as a concurrently executing task.
    ///
    /// The work function receives a context derived from `ctx` carrying the
    /// task's id.  A panic inside the work function is caught at this
    /// boundary and recorded as a `Failed` transition; it never crashes the
    /// scheduler or leaves waiters blocked.
    pub fn execute<F, Fut>(
        &self,
        ctx: &Context,
        run: F,
        validator: Option<TaskValidator>,
    ) -> Arc<Task>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, StorError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(id);
        self.tasks.insert(id, task.clone());

        let task_ctx = ctx.with_value(Key::TaskId, ContextValue::TaskId(id));
        task_ctx.debug(format!("task {id} scheduled"));
        task.start();

        let handle = task.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(run(task_ctx)).catch_unwind().await {
                Err(panic) => handle.fail(StorError::TaskPanic(panic_message(panic))),
                Ok(Err(err)) => handle.fail(err),
                Ok(Ok(result)) => {
                    if let Some(validate) = &validator {
                        if let Err(err) = validate(&result) {
                            handle.fail(err);
                            return;
                        }
                    }
                    handle.succeed(result);
                }
            }
        });

        task
    }

    /// Wait for one task to reach a terminal state and return its handle.
    ///
    /// Unknown ids return `None` immediately.
    pub async fn wait(&self, id: TaskId) -> Option<Arc<Task>> {
        let task = self.get(id)?;
        task.wait().await;
        Some(task)
    }

    /// Block until every referenced task has reached a terminal state.
    ///
    /// This is a pure wait-all join: it does not early-return on the first
    /// failure, so unrelated tasks always run to completion before the
    /// caller resumes.  Unknown ids are skipped with a warning.
    pub async fn wait_all(&self, ids: &[TaskId]) {
        for id in ids {
            match self.get(*id) {
                Some(task) => {
                    task.wait().await;
                }
                None => warn!(task_id = id, "wait_all: unknown task id, skipping"),
            }
        }
    }

    /// Like [`TaskTracker::wait_all`], but gives up after `timeout`.
    ///
    /// The referenced tasks keep running in the background; this only stops
    /// the wait, for boundary layers that hand back a handle for later
    /// polling instead of blocking indefinitely.
    pub async fn wait_all_timeout(
        &self,
        ids: &[TaskId],
        timeout: Duration,
    ) -> Result<(), StorError> {
        tokio::time::timeout(timeout, self.wait_all(ids))
            .await
            .map_err(|_| StorError::WaitTimeout(timeout))
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
