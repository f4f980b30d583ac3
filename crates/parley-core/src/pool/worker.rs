//! Worker threads and the jobs they execute.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Builder, Runtime};

use super::task::TaskRecord;

/// Per-worker resources a job may borrow while it runs.
pub(crate) struct WorkerScope {
    worker: usize,
    runtime: Option<Runtime>,
}

impl WorkerScope {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            runtime: None,
        }
    }

    /// The worker's private current-thread runtime, built on first use.
    ///
    /// Never shared with another worker or with the broadcast loop.
    pub(crate) fn runtime(&mut self) -> std::io::Result<&Runtime> {
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => {
                tracing::debug!(worker = self.worker, "Building worker-local runtime");
                Builder::new_current_thread().enable_all().build()?
            }
        };
        Ok(self.runtime.insert(runtime))
    }
}

pub(crate) struct Job {
    pub(crate) name: String,
    pub(crate) record: Arc<dyn TaskRecord>,
    pub(crate) run: Box<dyn FnOnce(&mut WorkerScope) + Send>,
}

pub(crate) struct QueueState {
    pub(crate) jobs: VecDeque<Job>,
    pub(crate) running: usize,
    pub(crate) closed: bool,
}

/// Queue, counters and the two wake-up signals, under one lock.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    /// A job was queued or the pool closed.
    available: Condvar,
    /// The pool has nothing queued and nothing running.
    drained: Condvar,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                running: 0,
                closed: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_one(&self) {
        self.available.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        self.available.notify_all();
        self.drained.notify_all();
    }

    pub(crate) fn drained(&self) -> &Condvar {
        &self.drained
    }

    /// Block until a job is available; `None` once closed and empty.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                state.running += 1;
                return Some(job);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn job_finished(&self) {
        let mut state = self.lock();
        state.running -= 1;
        if state.running == 0 && state.jobs.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Finish a job whose body will never run.
///
/// The body and its captures are dropped before the task turns terminal.
pub(crate) fn discard(run: Box<dyn FnOnce(&mut WorkerScope) + Send>, record: &dyn TaskRecord) {
    drop(run);
    record.abandon();
}

pub(crate) fn worker_loop(worker: usize, queue: Arc<WorkQueue>) {
    tracing::debug!(worker, "Worker started");
    let mut scope = WorkerScope::new(worker);

    while let Some(job) = queue.next_job() {
        let Job { name, record, run } = job;
        if record.is_cancelled() {
            tracing::debug!(worker, task = %name, "Skipping task cancelled before start");
            discard(run, record.as_ref());
        } else {
            tracing::trace!(worker, task = %name, "Running task");
            run(&mut scope);
        }
        queue.job_finished();
    }

    tracing::debug!(worker, "Worker exiting");
}
