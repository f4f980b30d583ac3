//! Timing record for the in-flight request.
//!
//! One [`RequestTracker`] is shared by the UI thread, pool workers and the
//! relay. It records once-per-request milestones (first response byte, first
//! audio frame, playback start) and process-lifetime totals, and tells
//! observers which fields changed after every mutation.

mod diff;
mod tracker;

pub use tracker::{ObserverId, RequestTracker};
