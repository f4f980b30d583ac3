use thiserror::Error;

use crate::event::StreamFailure;

/// Marker error returned from a cooperative cancellation checkpoint.
///
/// Task bodies propagate it with `?`; the pool recognises it and records the
/// task as cancelled rather than failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task cancelled")]
pub struct Cancelled;

/// Errors from task pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("task pool is shut down")]
    Closed,

    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{name}' still running after {waited_ms} ms")]
    Timeout { name: String, waited_ms: u64 },

    #[error("task '{0}' was cancelled")]
    Cancelled(String),

    #[error("task '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("task '{0}' produces a different result type")]
    TypeMismatch(String),

    #[error("result of task '{0}' was already collected")]
    ResultTaken(String),
}

/// Errors from relaying a chunked stream into a playback sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("malformed stream: ended after {received} bytes, header needs {needed}")]
    MalformedStream { received: u64, needed: usize },

    #[error("stream source error: {0}")]
    Source(String),

    #[error("playback sink error: {0}")]
    Sink(String),

    #[error("relay cancelled")]
    Cancelled,
}

impl RelayError {
    /// The event-level classification of this error.
    pub fn failure(&self) -> StreamFailure {
        match self {
            RelayError::MalformedStream { .. } => StreamFailure::Malformed,
            RelayError::Source(_) => StreamFailure::Source,
            RelayError::Sink(_) => StreamFailure::Sink,
            RelayError::Cancelled => StreamFailure::Cancelled,
        }
    }
}

/// Errors raised by a playback sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("playback device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("playback sink closed")]
    Closed,
}

/// Per-connection delivery failure. Never fatal to a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("send failed: {0}")]
    Send(String),

    #[error("send timed out after {0} ms")]
    Timeout(u64),

    #[error("connection closed")]
    Closed,
}
