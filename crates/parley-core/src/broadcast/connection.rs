//! Listener connection abstraction.
//!
//! [`Connection`] uses native async fn in traits; [`ConnectionDyn`] is its
//! object-safe twin with boxed futures, blanket-implemented for every
//! `Connection`, so the broadcaster can hold heterogeneous connections.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use parley_types::error::DeliveryFailure;
use serde::Serialize;
use uuid::Uuid;

/// Identity of one live listener connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An outbound channel to one remote listener.
///
/// Implementations are driven only on the broadcaster's loop thread.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Deliver one text message. An error drops the connection.
    fn send_text(
        &self,
        message: &str,
    ) -> impl Future<Output = Result<(), DeliveryFailure>> + Send;
}

/// Object-safe version of [`Connection`].
pub trait ConnectionDyn: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn send_text_boxed<'a>(
        &'a self,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryFailure>> + Send + 'a>>;
}

impl<T: Connection> ConnectionDyn for T {
    fn id(&self) -> ConnectionId {
        Connection::id(self)
    }

    fn send_text_boxed<'a>(
        &'a self,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryFailure>> + Send + 'a>> {
        Box::pin(self.send_text(message))
    }
}
