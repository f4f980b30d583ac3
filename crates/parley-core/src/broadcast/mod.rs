//! Loop-affine delivery to remote listeners.
//!
//! All listener connections live on one event loop ([`LoopDispatcher`]).
//! Other threads never touch a connection directly: [`Broadcaster::send`]
//! enqueues a broadcast job on the loop, which preserves per-thread ordering
//! and keeps every socket write on a single thread.

mod broadcaster;
mod connection;
mod dispatcher;

pub use broadcaster::Broadcaster;
pub use connection::{Connection, ConnectionDyn, ConnectionId};
pub use dispatcher::{LoopDispatcher, LoopHandle};
