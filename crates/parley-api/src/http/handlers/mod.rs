//! Route handlers.

pub mod speech;
pub mod ws;
