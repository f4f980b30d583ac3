//! Rate limiting for UI status lines.
//!
//! Workers report progress far more often than a status bar can usefully
//! redraw. `StatusDebouncer` publishes at most one `Status` event per
//! interval and keeps the most recent suppressed message for `flush`.
//! A marshaled debouncer routes its events through the bus's owning thread.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use parley_types::event::ClientEvent;

use super::bus::EventBus;

#[derive(Default)]
struct DebounceState {
    last_sent: Option<Instant>,
    pending: Option<String>,
}

pub struct StatusDebouncer {
    bus: EventBus,
    interval: Duration,
    marshaled: bool,
    state: Mutex<DebounceState>,
}

impl StatusDebouncer {
    pub fn new(bus: EventBus, interval: Duration) -> Self {
        Self {
            bus,
            interval,
            marshaled: false,
            state: Mutex::new(DebounceState::default()),
        }
    }

    /// Like [`new`](Self::new), but delivers through
    /// [`EventBus::publish_marshaled`] for UI subscribers.
    pub fn marshaled(bus: EventBus, interval: Duration) -> Self {
        Self {
            marshaled: true,
            ..Self::new(bus, interval)
        }
    }

    /// Publish `message` now if the interval has elapsed, otherwise hold it.
    ///
    /// Returns whether the message was published immediately.
    pub fn post(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let due = state
                .last_sent
                .is_none_or(|last| now.duration_since(last) >= self.interval);
            if !due {
                state.pending = Some(message);
                return false;
            }
            state.last_sent = Some(now);
            state.pending = None;
        }
        self.emit(message);
        true
    }

    /// Publish the held message, if any, regardless of the interval.
    pub fn flush(&self) -> bool {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_sent = Some(Instant::now());
            }
            pending
        };
        match pending {
            Some(message) => {
                self.emit(message);
                true
            }
            None => false,
        }
    }

    fn emit(&self, message: String) {
        let event = ClientEvent::status(message);
        if self.marshaled {
            self.bus.publish_marshaled(event);
        } else {
            self.bus.publish(event);
        }
    }
}
