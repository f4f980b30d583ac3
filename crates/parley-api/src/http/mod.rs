//! Listener endpoint for `parley serve`.
//!
//! Axum router hosted on the broadcast event loop: a websocket at
//! `/ws/events` for listeners and a small JSON API under `/api/v1/`.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
