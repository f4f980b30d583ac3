//! Explicit error-handling combinators for units of work.
//!
//! Call sites compose these around a `Result` instead of wrapping functions
//! implicitly: `or_fallback` logs and substitutes a value, `report` logs and
//! publishes an [`ClientEvent::Error`] for the UI, and `retry` reruns a
//! fallible step a bounded number of times.

use std::any::Any;
use std::fmt::Display;
use std::time::Duration;

use parley_types::event::ClientEvent;

use crate::event::EventBus;

/// Log `result`'s error under `stage` and return `fallback` in its place.
pub fn or_fallback<T, E: Display>(stage: &str, result: Result<T, E>, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(stage, error = %err, "Falling back after error");
            fallback
        }
    }
}

/// Log `result`'s error and publish it on `bus` as a request-level error.
pub fn report<T, E: Display>(bus: &EventBus, stage: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::error!(stage, error = %err, "Stage failed");
            bus.publish(ClientEvent::error(stage, &err));
            None
        }
    }
}

/// Run `op` up to `attempts` times, sleeping `backoff * attempt` between tries.
///
/// Blocking; intended for pool workers. Returns the last error when every
/// attempt fails.
pub fn retry<T, F>(stage: &str, attempts: u32, backoff: Duration, mut op: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> anyhow::Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(stage, attempt, attempts, error = %err, "Attempt failed, retrying");
                std::thread::sleep(backoff * attempt);
                attempt += 1;
            }
            Err(err) => {
                return Err(err.context(format!("{stage}: gave up after {attempts} attempts")));
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
