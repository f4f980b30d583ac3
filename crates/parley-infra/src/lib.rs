//! Infrastructure layer for Parley.
//!
//! Concrete adapters for the traits defined in `parley-core`: the reqwest
//! streaming chunk source, file and channel playback sinks, and the
//! `config.toml` loader.

pub mod config;
pub mod http;
pub mod sink;
