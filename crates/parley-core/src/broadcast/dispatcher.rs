//! The single event loop that owns every listener connection.
//!
//! A [`LoopDispatcher`] runs a current-thread tokio runtime on a dedicated OS
//! thread and drains a FIFO of jobs, awaiting each one before taking the next.
//! Any thread may enqueue through a cloneable [`LoopHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle as TaskHandle;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Enqueue side of a [`LoopDispatcher`].
#[derive(Clone)]
pub struct LoopHandle {
    name: Arc<str>,
    jobs: mpsc::UnboundedSender<Job>,
    thread: ThreadId,
    runtime: Handle,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind every job already queued.
    ///
    /// Returns `false` once the loop has stopped.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.send(Box::pin(job)).is_err() {
            tracing::warn!(event_loop = %self.name, "Dispatch after loop stopped; job dropped");
            return false;
        }
        true
    }

    /// Run `future` on the loop concurrently with queued jobs.
    ///
    /// For long-lived work such as the listener server.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Dispatch `job` and block the calling thread until it produces a value.
    ///
    /// `None` if the loop stopped first, or when called on the loop thread
    /// itself, where waiting would deadlock.
    pub fn call<T, F>(&self, job: F) -> Option<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        if self.is_loop_thread() {
            tracing::warn!(event_loop = %self.name, "LoopHandle::call from the loop thread");
            return None;
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let queued = self.dispatch(async move {
            let _ = tx.send(job.await);
        });
        if !queued {
            return None;
        }
        rx.recv().ok()
    }

    pub fn is_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.name)
            .field("thread", &self.thread)
            .finish()
    }
}

/// Owner of the loop thread. Dropping it stops the loop and joins the thread.
pub struct LoopDispatcher {
    handle: LoopHandle,
    stop: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl LoopDispatcher {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let runtime_handle = runtime.handle().clone();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let stop = CancellationToken::new();

        let loop_stop = stop.clone();
        let loop_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!(event_loop = %loop_name, "Event loop started");
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = loop_stop.cancelled() => break,
                            job = queue.recv() => match job {
                                Some(job) => job.await,
                                None => break,
                            },
                        }
                    }
                });
                tracing::debug!(event_loop = %loop_name, "Event loop stopped");
            })?;

        let handle = LoopHandle {
            name: Arc::from(name),
            jobs,
            thread: thread.thread().id(),
            runtime: runtime_handle,
        };
        Ok(Self {
            handle,
            stop,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop after the job in progress, drop queued jobs and join the thread.
    pub fn shutdown(&mut self) {
        self.stop.cancel();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.handle.is_loop_thread() {
            tracing::warn!(event_loop = %self.handle.name, "Loop shut down from its own thread; not joining");
            return;
        }
        if thread.join().is_err() {
            tracing::warn!(event_loop = %self.handle.name, "Event loop thread panicked");
        }
    }
}

impl Drop for LoopDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
