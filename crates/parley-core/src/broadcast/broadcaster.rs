use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use parley_types::config::ClientConfig;
use parley_types::error::DeliveryFailure;
use parley_types::event::ClientEvent;

use super::connection::{Connection, ConnectionDyn, ConnectionId};
use super::dispatcher::LoopHandle;

type SharedConnection = Arc<dyn ConnectionDyn>;

struct BroadcasterInner {
    event_loop: OnceLock<LoopHandle>,
    connections: Mutex<Vec<SharedConnection>>,
    delivery_timeout: Duration,
}

/// Fans text messages out to every live listener connection.
///
/// `send` may be called from any thread; delivery always happens on the
/// registered loop. Cloning shares the same connection set.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                event_loop: OnceLock::new(),
                connections: Mutex::new(Vec::new()),
                delivery_timeout,
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.delivery_timeout())
    }

    /// Bind the broadcaster to its loop. Only the first call takes effect.
    pub fn register_loop(&self, handle: LoopHandle) -> bool {
        let name = handle.name().to_string();
        match self.inner.event_loop.set(handle) {
            Ok(()) => {
                tracing::info!(event_loop = %name, "Broadcaster bound to event loop");
                true
            }
            Err(_) => {
                tracing::warn!(event_loop = %name, "Broadcaster loop already registered; ignoring");
                false
            }
        }
    }

    pub fn event_loop(&self) -> Option<&LoopHandle> {
        self.inner.event_loop.get()
    }

    /// Start delivering to `connection`. Call from the loop thread.
    pub fn connect<C: Connection + 'static>(&self, connection: C) -> ConnectionId {
        self.connect_shared(Arc::new(connection))
    }

    pub fn connect_shared(&self, connection: SharedConnection) -> ConnectionId {
        let on_loop = self
            .inner
            .event_loop
            .get()
            .is_some_and(LoopHandle::is_loop_thread);
        if !on_loop {
            tracing::warn!("Broadcaster::connect called off the event loop thread");
        }

        let id = connection.id();
        let count = {
            let mut connections = self.lock();
            connections.push(connection);
            connections.len()
        };
        tracing::info!(connection = %id, count, "Listener connected");
        id
    }

    /// Forget a connection. Safe to call repeatedly and from any thread.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.inner.disconnect(id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Queue `message` for every live connection. Never blocks on delivery.
    ///
    /// A no-op when no loop is registered or nobody is listening.
    pub fn send(&self, message: impl Into<String>) {
        let Some(event_loop) = self.inner.event_loop.get() else {
            tracing::trace!("Broadcast skipped: no event loop registered");
            return;
        };
        if self.connection_count() == 0 {
            return;
        }
        let message: Arc<str> = Arc::from(message.into());
        let inner = Arc::clone(&self.inner);
        event_loop.dispatch(async move {
            inner.broadcast(&message).await;
        });
    }

    /// Serialize `event` and [`send`](Self::send) it.
    pub fn send_event(&self, event: &ClientEvent) {
        match serde_json::to_string(event) {
            Ok(json) => self.send(json),
            Err(err) => tracing::warn!(kind = %event.kind(), error = %err, "Failed to serialize event"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedConnection>> {
        self.inner.lock()
    }
}

impl BroadcasterInner {
    fn lock(&self) -> MutexGuard<'_, Vec<SharedConnection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disconnect(&self, id: ConnectionId) -> bool {
        let mut connections = self.lock();
        let before = connections.len();
        connections.retain(|connection| connection.id() != id);
        let removed = connections.len() != before;
        if removed {
            tracing::info!(connection = %id, count = connections.len(), "Listener disconnected");
        }
        removed
    }

    /// Deliver to a snapshot of the connection set, dropping failures.
    async fn broadcast(&self, message: &str) {
        let snapshot: Vec<SharedConnection> = self.lock().clone();
        for connection in snapshot {
            let outcome =
                tokio::time::timeout(self.delivery_timeout, connection.send_text_boxed(message))
                    .await
                    .unwrap_or_else(|_| {
                        Err(DeliveryFailure::Timeout(self.delivery_timeout.as_millis() as u64))
                    });
            if let Err(failure) = outcome {
                tracing::warn!(
                    connection = %connection.id(),
                    error = %failure,
                    "Dropping listener after failed delivery"
                );
                self.disconnect(connection.id());
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("event_loop", &self.inner.event_loop.get())
            .field("connections", &self.connection_count())
            .field("delivery_timeout", &self.inner.delivery_timeout)
            .finish()
    }
}
