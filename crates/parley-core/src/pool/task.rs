//! Task records shared between the pool, its workers and task handles.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use parley_types::error::{Cancelled, PoolError};
use parley_types::task::TaskState;
use tokio_util::sync::CancellationToken;

/// Runs once when a task reaches a terminal state, before waiters wake.
pub(crate) type CompletionHook = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    state: TaskState,
    outcome: Option<Result<T, PoolError>>,
}

/// Typed completion slot for one task.
pub(crate) struct TaskShared<T> {
    name: String,
    token: CancellationToken,
    slot: Mutex<Slot<T>>,
    finished: Condvar,
    on_complete: Mutex<Option<CompletionHook>>,
}

impl<T: Send + 'static> TaskShared<T> {
    pub(crate) fn new(name: String, on_complete: CompletionHook) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            slot: Mutex::new(Slot {
                state: TaskState::Pending,
                outcome: None,
            }),
            finished: Condvar::new(),
            on_complete: Mutex::new(Some(on_complete)),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Move `Pending -> Running`. Returns `false` if the task already finished.
    pub(crate) fn mark_running(&self) -> bool {
        let mut slot = self.lock_slot();
        if slot.state != TaskState::Pending {
            return false;
        }
        slot.state = TaskState::Running;
        true
    }

    /// Record the body's outcome and wake every waiter.
    pub(crate) fn complete(&self, outcome: anyhow::Result<T>) {
        let (state, outcome) = match outcome {
            Ok(value) => (TaskState::Done, Ok(value)),
            Err(err) if err.is::<Cancelled>() => {
                (TaskState::Cancelled, Err(PoolError::Cancelled(self.name.clone())))
            }
            Err(err) => (
                TaskState::Failed,
                Err(PoolError::Failed {
                    name: self.name.clone(),
                    message: format!("{err:#}"),
                }),
            ),
        };
        self.finish(state, outcome);
    }

    pub(crate) fn fail(&self, message: String) {
        self.finish(
            TaskState::Failed,
            Err(PoolError::Failed {
                name: self.name.clone(),
                message,
            }),
        );
    }

    fn finish(&self, state: TaskState, outcome: Result<T, PoolError>) {
        // Reap from the active table first so a woken waiter never observes
        // a finished task still listed as active.
        let hook = self
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }

        let mut slot = self.lock_slot();
        if slot.state.is_terminal() {
            return;
        }
        slot.state = state;
        slot.outcome = Some(outcome);
        drop(slot);
        self.finished.notify_all();
    }

    /// Block until the task finishes or `timeout` elapses, then take its result.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<T, PoolError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut slot = self.lock_slot();
        while !slot.state.is_terminal() {
            slot = match deadline {
                None => self
                    .finished
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout {
                            name: self.name.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    self.finished
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        slot.outcome
            .take()
            .unwrap_or_else(|| Err(PoolError::ResultTaken(self.name.clone())))
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Type-erased view of a task, stored in the pool's active table.
pub(crate) trait TaskRecord: Send + Sync {
    fn state(&self) -> TaskState;
    fn is_cancelled(&self) -> bool;
    /// Request cancellation. `false` once the task has finished.
    fn cancel(&self) -> bool;
    /// Finish a task that never ran.
    fn abandon(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> TaskRecord for TaskShared<T> {
    fn state(&self) -> TaskState {
        self.lock_slot().state
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.token.cancel();
        true
    }

    fn abandon(&self) {
        self.token.cancel();
        self.finish(TaskState::Cancelled, Err(PoolError::Cancelled(self.name.clone())));
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Caller-side handle to a submitted task.
///
/// The task's value is yielded once, to whichever of [`TaskHandle::join`] or
/// `TaskPool::await_result` collects it first.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(shared: Arc<TaskShared<T>>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> TaskState {
        TaskRecord::state(self.shared.as_ref())
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cooperative cancellation. `false` if the task already finished.
    pub fn cancel(&self) -> bool {
        TaskRecord::cancel(self.shared.as_ref())
    }

    /// Wait for the task's result. `None` waits indefinitely.
    pub fn join(&self, timeout: Option<Duration>) -> Result<T, PoolError> {
        self.shared.wait(timeout)
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}

/// Passed to every task body: its name and its cancellation checkpoint.
#[derive(Debug, Clone)]
pub struct TaskContext {
    name: String,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(name: String, token: CancellationToken) -> Self {
        Self { name, token }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative cancellation point: `Err(Cancelled)` once cancellation
    /// was requested. Propagate it with `?`.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token for async bodies (`token.cancelled().await` in a `select!`).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
