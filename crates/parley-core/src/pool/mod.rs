//! Fixed-size worker pool for blocking and isolated async work.
//!
//! `TaskPool` owns `workers` OS threads that pull jobs from one FIFO queue.
//! Every submission gets a name (explicit, or `task-<n>` from a monotonic
//! counter) and is listed in the active table until its completion hook
//! reaps it. Terminal tasks are not retained: callers that need a result keep
//! the returned [`TaskHandle`] or collect it with [`TaskPool::await_result`]
//! before the task finishes.
//!
//! Cancellation is cooperative. A task cancelled while still queued never
//! runs its body; a running task observes cancellation at
//! [`TaskContext::checkpoint`] or through [`TaskContext::token`].
//!
//! `submit_async` runs a future to completion on a current-thread tokio
//! runtime private to the worker that picked it up. It never shares a loop
//! with the broadcast dispatcher.

mod task;
mod worker;

pub use task::{TaskContext, TaskHandle};

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parley_types::config::ClientConfig;
use parley_types::error::PoolError;
use parley_types::task::TaskState;

use crate::guard::panic_message;
use task::{TaskRecord, TaskShared};
use worker::{Job, WorkQueue, WorkerScope, discard, worker_loop};

#[derive(Clone)]
struct ActiveTask {
    id: u64,
    record: Arc<dyn TaskRecord>,
}

pub struct TaskPool {
    queue: Arc<WorkQueue>,
    active: Arc<DashMap<String, ActiveTask>>,
    next_id: AtomicU64,
    workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Spawn a pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let queue = Arc::new(WorkQueue::new());
        let mut threads = Vec::with_capacity(workers);
        for index in 0..workers {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("parley-worker-{index}"))
                .spawn(move || worker_loop(index, queue))?;
            threads.push(handle);
        }
        tracing::info!(workers, "TaskPool started");

        Ok(Self {
            queue,
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            workers,
            threads: Mutex::new(threads),
        })
    }

    pub fn from_config(config: &ClientConfig) -> std::io::Result<Self> {
        Self::new(config.workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a blocking closure.
    pub fn submit<T, F>(&self, name: Option<&str>, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> anyhow::Result<T> + Send + 'static,
    {
        self.enqueue(name, move |ctx, _scope| f(ctx))
    }

    /// Queue an async routine to run on the picking worker's private runtime.
    pub fn submit_async<T, F, Fut>(
        &self,
        name: Option<&str>,
        f: F,
    ) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        self.enqueue(name, move |ctx, scope| {
            let runtime = scope.runtime()?;
            runtime.block_on(f(ctx))
        })
    }

    fn enqueue<T, B>(&self, name: Option<&str>, body: B) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        B: FnOnce(TaskContext, &mut WorkerScope) -> anyhow::Result<T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.map_or_else(|| format!("task-{id}"), str::to_owned);

        let table = Arc::downgrade(&self.active);
        let reap_name = name.clone();
        let shared = Arc::new(TaskShared::<T>::new(
            name.clone(),
            Box::new(move || {
                if let Some(table) = table.upgrade() {
                    table.remove_if(&reap_name, |_, entry| entry.id == id);
                }
            }),
        ));

        let task = Arc::clone(&shared);
        let task_name = name.clone();
        let run = Box::new(move |scope: &mut WorkerScope| {
            if !task.mark_running() {
                return;
            }
            let ctx = TaskContext::new(task_name.clone(), task.token().clone());
            match catch_unwind(AssertUnwindSafe(|| body(ctx, scope))) {
                Ok(outcome) => {
                    if let Err(err) = &outcome {
                        tracing::debug!(task = %task_name, error = %err, "Task body returned error");
                    }
                    task.complete(outcome);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(task = %task_name, panic = %message, "Task panicked");
                    task.fail(format!("panicked: {message}"));
                }
            }
        });

        let record: Arc<dyn TaskRecord> = shared.clone();
        {
            let mut state = self.queue.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let previous = self.active.insert(
                name.clone(),
                ActiveTask {
                    id,
                    record: Arc::clone(&record),
                },
            );
            if previous.is_some() {
                tracing::debug!(task = %name, "Task name reused; newest submission owns it");
            }
            state.jobs.push_back(Job {
                name: name.clone(),
                record,
                run,
            });
        }
        self.queue.notify_one();
        tracing::debug!(task = %name, "Task submitted");

        Ok(TaskHandle::new(shared))
    }

    /// Request cancellation of the named task.
    ///
    /// Returns `true` when the request was accepted: the task was still queued
    /// (its body will never run) or is running and will see it at its next
    /// checkpoint. `false` for unknown or already finished tasks.
    pub fn cancel(&self, name: &str) -> bool {
        let Some(record) = self.lookup(name) else {
            return false;
        };
        let accepted = record.cancel();
        tracing::debug!(task = %name, accepted, "Task cancellation requested");
        accepted
    }

    /// Wait for the named task and take its result.
    ///
    /// Fails with `NotFound` for unknown or already reaped names and with
    /// `Timeout` once `timeout` elapses; the task keeps running in that case.
    pub fn await_result<T: Send + 'static>(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<T, PoolError> {
        let record = self
            .lookup(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        let shared = record
            .into_any()
            .downcast::<TaskShared<T>>()
            .map_err(|_| PoolError::TypeMismatch(name.to_string()))?;
        shared.wait(timeout)
    }

    /// Name of every task not yet reaped, mapped to whether it is running.
    pub fn active_tasks(&self) -> HashMap<String, bool> {
        self.active
            .iter()
            .map(|entry| {
                let running = entry.value().record.state() == TaskState::Running;
                (entry.key().clone(), running)
            })
            .collect()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.lookup(name).map(|record| record.state())
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Close the pool to new submissions.
    ///
    /// Without `wait`, returns at once and already submitted tasks complete
    /// in the background. With `wait`, queued tasks are cancelled, running
    /// tasks are signalled, and the call blocks until nothing is running or
    /// `timeout` elapses. Returns whether the pool fully drained.
    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) -> bool {
        if !wait {
            let running = {
                let mut state = self.queue.lock();
                state.closed = true;
                state.running + state.jobs.len()
            };
            self.queue.notify_all();
            return running == 0;
        }

        let abandoned: Vec<Job> = {
            let mut state = self.queue.lock();
            state.closed = true;
            state.jobs.drain(..).collect()
        };
        self.queue.notify_all();

        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "Cancelling queued tasks");
        }
        for Job { name, record, run } in abandoned {
            tracing::debug!(task = %name, "Queued task cancelled by shutdown");
            discard(run, record.as_ref());
        }

        let running: Vec<Arc<dyn TaskRecord>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(&entry.value().record))
            .collect();
        for record in running {
            record.cancel();
        }

        let drained = self.wait_drained(timeout);
        if drained {
            self.join_workers();
            tracing::info!("TaskPool drained and stopped");
        } else {
            tracing::warn!(
                still_running = self.active.len(),
                "TaskPool shutdown timed out; leaving tasks to finish in the background"
            );
        }
        drained
    }

    fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.queue.lock();
        while state.running > 0 {
            state = match deadline {
                None => self
                    .queue
                    .drained()
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.queue
                        .drained()
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }

    fn join_workers(&self) {
        let threads =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("Worker thread panicked outside a task");
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn TaskRecord>> {
        self.active
            .get(name)
            .map(|entry| Arc::clone(&entry.value().record))
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown(false, None);
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.workers)
            .field("active", &self.active.len())
            .finish()
    }
}
