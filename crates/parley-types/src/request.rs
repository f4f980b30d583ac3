//! Per-request timing state.
//!
//! `RequestState` is the record a request tracker keeps for the single
//! in-flight request: when it started, when each milestone was first
//! reached, and process-lifetime totals that survive resets.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A once-per-request timing milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    /// First byte of the response stream.
    FirstResponse,
    /// First audio frame cut from the stream.
    FirstAudio,
    /// First frame accepted by the playback sink.
    PlaybackStart,
}

impl Milestone {
    pub fn field_name(&self) -> &'static str {
        match self {
            Milestone::FirstResponse => "first_response_ms",
            Milestone::FirstAudio => "first_audio_ms",
            Milestone::PlaybackStart => "playback_start_ms",
        }
    }
}

/// Aggregate request counters. Never reset for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestTotals {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

impl RequestTotals {
    /// Requests started but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.total.saturating_sub(self.success + self.failed)
    }
}

/// Snapshot of the tracked request.
///
/// Milestones are elapsed milliseconds since `start`, measured on the
/// monotonic clock, and each is set at most once per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestState {
    /// Bumped on every change.
    pub version: u64,
    pub request_type: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub start: Option<Instant>,
    pub first_response_ms: Option<f64>,
    pub first_audio_ms: Option<f64>,
    pub playback_start_ms: Option<f64>,
    pub is_processing: bool,
    pub totals: RequestTotals,
}

impl RequestState {
    /// Reinitialize every per-request field; keep `totals` and `version`.
    pub fn reset(&mut self) {
        *self = RequestState {
            version: self.version,
            totals: self.totals,
            ..RequestState::default()
        };
    }

    pub fn milestone(&self, milestone: Milestone) -> Option<f64> {
        match milestone {
            Milestone::FirstResponse => self.first_response_ms,
            Milestone::FirstAudio => self.first_audio_ms,
            Milestone::PlaybackStart => self.playback_start_ms,
        }
    }

    pub fn milestone_mut(&mut self, milestone: Milestone) -> &mut Option<f64> {
        match milestone {
            Milestone::FirstResponse => &mut self.first_response_ms,
            Milestone::FirstAudio => &mut self.first_audio_ms,
            Milestone::PlaybackStart => &mut self.playback_start_ms,
        }
    }
}

/// Old and new value of one changed field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Changed fields keyed by name (`totals.*` fields use dotted names).
pub type ChangeSet = BTreeMap<String, FieldChange>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_totals_and_version() {
        let mut state = RequestState {
            version: 7,
            request_type: Some("speech".to_string()),
            started_at: Some(Utc::now()),
            start: Some(Instant::now()),
            first_response_ms: Some(12.5),
            first_audio_ms: Some(40.0),
            playback_start_ms: None,
            is_processing: true,
            totals: RequestTotals {
                total: 3,
                success: 1,
                failed: 1,
            },
        };
        state.reset();
        assert_eq!(state.version, 7);
        assert_eq!(state.totals.total, 3);
        assert!(state.request_type.is_none());
        assert!(state.start.is_none());
        assert!(state.first_response_ms.is_none());
        assert!(!state.is_processing);
    }

    #[test]
    fn in_flight_counts_unfinished() {
        let totals = RequestTotals {
            total: 5,
            success: 2,
            failed: 1,
        };
        assert_eq!(totals.in_flight(), 2);
    }

    #[test]
    fn milestone_accessors_agree() {
        let mut state = RequestState::default();
        *state.milestone_mut(Milestone::FirstAudio) = Some(3.0);
        assert_eq!(state.milestone(Milestone::FirstAudio), Some(3.0));
        assert_eq!(state.first_audio_ms, Some(3.0));
        assert_eq!(Milestone::FirstAudio.field_name(), "first_audio_ms");
    }

    #[test]
    fn start_instant_is_not_serialized() {
        let state = RequestState {
            start: Some(Instant::now()),
            ..RequestState::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("start").is_none());
        assert_eq!(json["totals"]["total"], 0);
    }
}
