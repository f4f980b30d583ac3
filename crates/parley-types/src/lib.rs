//! Shared domain types for Parley.
//!
//! This crate contains the types passed between the coordination layer's
//! components: client events, request timing state, task states, errors and
//! the client configuration.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod request;
pub mod task;
