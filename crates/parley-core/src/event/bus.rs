//! Callback event bus for distributing `ClientEvent` to subscribers.
//!
//! Subscriptions are keyed by [`EventKind`]. `publish` snapshots the
//! subscriber list for the event's kind under a short-held lock and then
//! invokes the callbacks outside it, so a callback may itself subscribe or
//! unsubscribe without deadlocking. Each callback is isolated: a panic is
//! caught and logged and the remaining subscribers still run.
//!
//! Subscribers that are not thread-safe (UI widgets) use
//! [`EventBus::publish_marshaled`] together with the bus's [`MarshalPump`],
//! which the owning thread drains to run delivery on itself.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use parley_types::event::{ClientEvent, EventKind};

use crate::guard::panic_message;

/// Handle identifying one subscription, returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct BusInner {
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
    marshal_tx: mpsc::Sender<ClientEvent>,
    marshal_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

/// Multi-producer, multi-subscriber event bus.
///
/// Cloning the bus shares the same subscriber table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (marshal_tx, marshal_rx) = mpsc::channel();
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                marshal_tx,
                marshal_rx: Mutex::new(Some(marshal_rx)),
            }),
        }
    }

    /// Register `callback` for every future event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::debug!(%kind, subscription = id.0, "EventBus::subscribe");
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&kind);
        }
        removed
    }

    /// Deliver `event` to every subscriber of its kind, on the calling thread.
    ///
    /// Subscribers fire in registration order. A kind with no subscribers is
    /// a no-op.
    pub fn publish(&self, event: ClientEvent) {
        self.deliver(&event);
    }

    /// Queue `event` for delivery on the thread that drains the [`MarshalPump`].
    pub fn publish_marshaled(&self, event: ClientEvent) {
        if let Err(mpsc::SendError(event)) = self.inner.marshal_tx.send(event) {
            // The pump was taken and then dropped.
            tracing::warn!(
                kind = %event.kind(),
                "EventBus::publish_marshaled: no owning thread is pumping, event dropped"
            );
        }
    }

    /// Take the pump for marshaled delivery. Only the first caller gets it.
    pub fn marshal_pump(&self) -> Option<MarshalPump> {
        let rx = self
            .inner
            .marshal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(MarshalPump {
            rx,
            bus: self.clone(),
        })
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.lock_subscribers().clear();
        tracing::debug!("EventBus::clear");
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock_subscribers().get(&kind).map_or(0, Vec::len)
    }

    fn deliver(&self, event: &ClientEvent) {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, Callback)> = match self.lock_subscribers().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };

        for (id, callback) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                tracing::warn!(
                    %kind,
                    subscription = id.0,
                    panic = %panic_message(payload.as_ref()),
                    "Event subscriber panicked; continuing with remaining subscribers"
                );
            }
        }
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Callback)>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions: usize = self.lock_subscribers().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscriptions", &subscriptions)
            .finish()
    }
}

/// Drains marshaled events on the owning thread.
///
/// Not `Sync`: it is meant to live on exactly one thread (typically the UI
/// thread), which calls [`pump`](Self::pump) from its own event loop.
pub struct MarshalPump {
    rx: mpsc::Receiver<ClientEvent>,
    bus: EventBus,
}

impl MarshalPump {
    /// Deliver every queued event without blocking. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.bus.deliver(&event);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for the first event, then drain the queue.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.bus.deliver(&event);
                1 + self.pump()
            }
            Err(_) => 0,
        }
    }
}
