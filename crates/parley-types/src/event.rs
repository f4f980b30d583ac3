//! Event types for the Parley client event bus.
//!
//! `ClientEvent` is the unified event type published while a request moves
//! through the streaming pipeline. Subscriptions are keyed by [`EventKind`],
//! the payload-free discriminant of each variant, so dispatch is exhaustive
//! and typed rather than keyed by free-form strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminant of a [`ClientEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StreamFirstByte,
    StreamFrame,
    PlaybackStarted,
    StreamEnd,
    StreamError,
    Error,
    Status,
    RequestFinished,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 8] = [
        EventKind::StreamFirstByte,
        EventKind::StreamFrame,
        EventKind::PlaybackStarted,
        EventKind::StreamEnd,
        EventKind::StreamError,
        EventKind::Error,
        EventKind::Status,
        EventKind::RequestFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StreamFirstByte => "stream_first_byte",
            EventKind::StreamFrame => "stream_frame",
            EventKind::PlaybackStarted => "playback_started",
            EventKind::StreamEnd => "stream_end",
            EventKind::StreamError => "stream_error",
            EventKind::Error => "error",
            EventKind::Status => "status",
            EventKind::RequestFinished => "request_finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a relayed stream stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFailure {
    /// The stream ended before the container header was complete.
    Malformed,
    /// The upstream source reported an I/O error.
    Source,
    /// The playback sink rejected a frame.
    Sink,
    /// The owning task was cancelled between chunks.
    Cancelled,
}

/// Events published on the client event bus.
///
/// All variants are `Clone + Send + Sync` so they can be fanned out to
/// subscribers on any thread and serialized for remote listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The first non-empty chunk arrived from the stream source.
    StreamFirstByte,

    /// A frame was cut from the stream and is about to be handed to the sink.
    ///
    /// Carries frame metadata only; the bytes themselves move into the sink.
    StreamFrame { index: u64, len: usize },

    /// The sink accepted its first frame.
    PlaybackStarted,

    /// The stream finished and every frame reached the sink.
    StreamEnd { frames: u64, bytes: u64 },

    /// The relay stopped early. Reported once per relay run.
    StreamError { failure: StreamFailure, cause: String },

    /// A request-level failure, with enough context for a UI to render it.
    Error { stage: String, cause: String },

    /// Human-readable progress for a status line.
    Status { message: String },

    /// The in-flight request completed.
    RequestFinished { success: bool },
}

impl ClientEvent {
    /// The subscription key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::StreamFirstByte => EventKind::StreamFirstByte,
            ClientEvent::StreamFrame { .. } => EventKind::StreamFrame,
            ClientEvent::PlaybackStarted => EventKind::PlaybackStarted,
            ClientEvent::StreamEnd { .. } => EventKind::StreamEnd,
            ClientEvent::StreamError { .. } => EventKind::StreamError,
            ClientEvent::Error { .. } => EventKind::Error,
            ClientEvent::Status { .. } => EventKind::Status,
            ClientEvent::RequestFinished { .. } => EventKind::RequestFinished,
        }
    }

    /// Convenience constructor for [`ClientEvent::Error`].
    pub fn error(stage: impl Into<String>, cause: impl fmt::Display) -> Self {
        ClientEvent::Error {
            stage: stage.into(),
            cause: cause.to_string(),
        }
    }

    /// Convenience constructor for [`ClientEvent::Status`].
    pub fn status(message: impl Into<String>) -> Self {
        ClientEvent::Status {
            message: message.into(),
        }
    }
}
