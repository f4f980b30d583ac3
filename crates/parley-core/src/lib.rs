//! Concurrency and streaming coordination for the Parley client.
//!
//! This crate glues synchronous client threads to asynchronous network I/O:
//!
//! - [`event`]: callback event bus with snapshot fan-out and marshaled delivery
//! - [`request`]: lock-protected timing record for the in-flight request
//! - [`pool`]: fixed-size worker pool with named, cancellable tasks
//! - [`relay`]: re-frames a chunked byte stream into fixed-size audio frames
//! - [`broadcast`]: single-loop dispatcher and listener fan-out
//! - [`guard`]: explicit logging/fallback combinators for units of work
//!
//! It depends only on `parley-types` -- never on `parley-infra` or any
//! transport crate.

pub mod broadcast;
pub mod event;
pub mod guard;
pub mod pool;
pub mod relay;
pub mod request;
