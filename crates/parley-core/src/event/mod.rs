//! Event bus for decoupling background producers from UI and logging consumers.
//!
//! Provides an [`EventBus`] that fans [`ClientEvent`]s out to callbacks keyed
//! by [`EventKind`], a [`MarshalPump`] for delivering events on a designated
//! owning thread, and a [`StatusDebouncer`] that rate-limits status lines.
//!
//! [`ClientEvent`]: parley_types::event::ClientEvent
//! [`EventKind`]: parley_types::event::EventKind

pub mod bus;
pub mod debounce;

pub use bus::{EventBus, MarshalPump, SubscriptionId};
pub use debounce::StatusDebouncer;
