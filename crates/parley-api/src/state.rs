//! Application state wiring the coordination components together.
//!
//! AppState is shared by the CLI commands and the listener endpoint. Cloning
//! is cheap; every component is reference-counted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parley_core::broadcast::Broadcaster;
use parley_core::event::{EventBus, StatusDebouncer};
use parley_core::pool::TaskPool;
use parley_core::request::RequestTracker;
use parley_types::config::ClientConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ClientConfig>,
    pub data_dir: PathBuf,
    pub bus: EventBus,
    pub tracker: Arc<RequestTracker>,
    pub pool: Arc<TaskPool>,
    pub broadcaster: Broadcaster,
    /// Status lines for the owning (UI) thread, delivered marshaled.
    pub status: Arc<StatusDebouncer>,
}

impl AppState {
    /// Wire every component for `config`; starts the worker pool.
    pub fn from_config(config: ClientConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        let config = config.normalized();
        let bus = EventBus::new();

        let tracker = Arc::new(RequestTracker::new());
        tracker.attach(&bus);

        let pool = TaskPool::from_config(&config).context("failed to start worker pool")?;
        let broadcaster = Broadcaster::from_config(&config);
        let status = StatusDebouncer::marshaled(bus.clone(), config.status_debounce());

        tracing::debug!(
            data_dir = %data_dir.display(),
            workers = config.workers,
            frame_size = config.frame_size,
            "Application state initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            data_dir,
            bus,
            tracker,
            pool: Arc::new(pool),
            broadcaster,
            status: Arc::new(status),
        })
    }

    /// Stop accepting work and wait up to `grace` for running tasks.
    pub fn shutdown(&self, grace: Duration) -> bool {
        let drained = self.pool.shutdown(true, Some(grace));
        if !drained {
            tracing::warn!(
                remaining = ?self.pool.active_tasks(),
                "Exiting with tasks still running"
            );
        }
        drained
    }
}
