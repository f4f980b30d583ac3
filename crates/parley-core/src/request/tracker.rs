use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use chrono::Utc;
use parley_types::event::{ClientEvent, EventKind};
use parley_types::request::{ChangeSet, Milestone, RequestState};

use super::diff::{diff, flatten};
use crate::event::{EventBus, SubscriptionId};
use crate::guard::panic_message;

/// Handle identifying one observer, returned by [`RequestTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct TrackerInner {
    state: RequestState,
    observers: Vec<(ObserverId, Observer)>,
}

/// Thread-safe owner of the single [`RequestState`].
///
/// Every operation takes the one lock, mutates, computes the field diff and
/// releases the lock before observers run, so observers may call back into the
/// tracker. Each observer call reflects one atomic mutation; delivery order
/// across threads is not guaranteed.
pub struct RequestTracker {
    inner: Mutex<TrackerInner>,
    next_observer: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                state: RequestState::default(),
                observers: Vec::new(),
            }),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Begin a new request, resetting per-request fields.
    ///
    /// `custom_start` backdates the start instant (e.g. to when the user
    /// stopped speaking). A request still in flight is counted as failed.
    pub fn start_request(&self, request_type: Option<&str>, custom_start: Option<Instant>) {
        let request_type = request_type.map(str::to_owned);
        self.mutate(|state| {
            if state.is_processing {
                tracing::warn!(
                    previous = ?state.request_type,
                    "Starting a request while another is in flight; counting it as failed"
                );
                state.totals.failed += 1;
            }

            let now = Instant::now();
            let start = custom_start.unwrap_or(now);
            let backdated = chrono::Duration::from_std(now.saturating_duration_since(start))
                .unwrap_or_else(|_| chrono::Duration::zero());

            state.reset();
            state.request_type = request_type;
            state.start = Some(start);
            state.started_at = Some(Utc::now() - backdated);
            state.is_processing = true;
            state.totals.total += 1;

            tracing::debug!(
                request_type = ?state.request_type,
                total = state.totals.total,
                "Request started"
            );
        });
    }

    /// Elapsed ms to the first response byte, or `0.0` if already recorded or
    /// no request is active.
    pub fn record_first_response(&self) -> f64 {
        self.record(Milestone::FirstResponse)
    }

    pub fn record_first_audio(&self) -> f64 {
        self.record(Milestone::FirstAudio)
    }

    pub fn record_playback_start(&self) -> f64 {
        self.record(Milestone::PlaybackStart)
    }

    fn record(&self, milestone: Milestone) -> f64 {
        self.mutate(|state| {
            let Some(start) = state.start.filter(|_| state.is_processing) else {
                tracing::debug!(milestone = milestone.field_name(), "No active request");
                return 0.0;
            };
            let slot = state.milestone_mut(milestone);
            if slot.is_some() {
                return 0.0;
            }
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            *slot = Some(elapsed_ms);
            tracing::debug!(milestone = milestone.field_name(), elapsed_ms, "Milestone reached");
            elapsed_ms
        })
    }

    /// Close the in-flight request and count it as a success or failure.
    ///
    /// Milestones stay readable until the next `start_request` or `reset`.
    pub fn finish_request(&self, success: bool) {
        self.mutate(|state| {
            if !state.is_processing {
                tracing::warn!(success, "finish_request called with no active request");
                return;
            }
            state.is_processing = false;
            if success {
                state.totals.success += 1;
            } else {
                state.totals.failed += 1;
            }
            tracing::info!(
                success,
                request_type = ?state.request_type,
                first_response_ms = ?state.first_response_ms,
                first_audio_ms = ?state.first_audio_ms,
                playback_start_ms = ?state.playback_start_ms,
                "Request finished"
            );
        });
    }

    /// Apply an arbitrary change to the per-request fields.
    ///
    /// `totals` and `version` are owned by the tracker; changes `f` makes to
    /// them are discarded.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RequestState),
    {
        self.mutate(|state| {
            let totals = state.totals;
            let version = state.version;
            f(state);
            state.totals = totals;
            state.version = version;
        });
    }

    /// Clear per-request fields. Totals survive.
    pub fn reset(&self) {
        self.mutate(RequestState::reset);
    }

    pub fn snapshot(&self) -> RequestState {
        self.lock().state.clone()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.lock().observers.push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
        inner.observers.len() != before
    }

    /// Drive the tracker from relay and pipeline events published on `bus`.
    ///
    /// The subscriptions hold only a weak reference, so they become inert
    /// once the tracker is dropped.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<(EventKind, SubscriptionId)> {
        let mut subscriptions = Vec::with_capacity(4);

        let tracker = Arc::downgrade(self);
        subscriptions.push((
            EventKind::StreamFirstByte,
            bus.subscribe(EventKind::StreamFirstByte, move |_| {
                with_tracker(&tracker, |t| {
                    t.record_first_response();
                });
            }),
        ));

        let tracker = Arc::downgrade(self);
        subscriptions.push((
            EventKind::StreamFrame,
            bus.subscribe(EventKind::StreamFrame, move |event| {
                if let ClientEvent::StreamFrame { index: 0, .. } = event {
                    with_tracker(&tracker, |t| {
                        t.record_first_audio();
                    });
                }
            }),
        ));

        let tracker = Arc::downgrade(self);
        subscriptions.push((
            EventKind::PlaybackStarted,
            bus.subscribe(EventKind::PlaybackStarted, move |_| {
                with_tracker(&tracker, |t| {
                    t.record_playback_start();
                });
            }),
        ));

        let tracker = Arc::downgrade(self);
        subscriptions.push((
            EventKind::RequestFinished,
            bus.subscribe(EventKind::RequestFinished, move |event| {
                if let ClientEvent::RequestFinished { success } = event {
                    with_tracker(&tracker, |t| t.finish_request(*success));
                }
            }),
        ));

        subscriptions
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut RequestState) -> R) -> R {
        let (result, changes, observers) = {
            let mut inner = self.lock();
            let before = flatten(&inner.state);
            let result = f(&mut inner.state);
            let changes = diff(&before, &flatten(&inner.state));
            if changes.is_empty() {
                return result;
            }
            inner.state.version += 1;
            let observers: Vec<Observer> = inner
                .observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();
            (result, changes, observers)
        };

        for observer in observers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(&changes))) {
                tracing::warn!(
                    panic = %panic_message(payload.as_ref()),
                    "RequestTracker observer panicked"
                );
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn with_tracker(tracker: &Weak<RequestTracker>, f: impl FnOnce(&RequestTracker)) {
    if let Some(tracker) = tracker.upgrade() {
        f(&tracker);
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("state", &self.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn backdated(ms: u64) -> Option<Instant> {
        Instant::now().checked_sub(Duration::from_millis(ms))
    }

    #[test]
    fn first_response_is_recorded_once() {
        let tracker = RequestTracker::new();
        tracker.start_request(Some("speech"), backdated(10));

        let first = tracker.record_first_response();
        assert!(first > 0.0, "expected positive elapsed, got {first}");
        assert_eq!(tracker.record_first_response(), 0.0);
        assert_eq!(tracker.snapshot().first_response_ms, Some(first));
    }

    #[test]
    fn milestones_without_active_request_return_zero() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.record_first_audio(), 0.0);
        assert_eq!(tracker.record_playback_start(), 0.0);
        assert_eq!(tracker.snapshot().version, 0);
    }

    #[test]
    fn totals_never_overcount() {
        let tracker = RequestTracker::new();
        tracker.finish_request(true);
        assert_eq!(tracker.snapshot().totals.success, 0);

        tracker.start_request(None, None);
        tracker.finish_request(true);
        tracker.finish_request(false);
        tracker.start_request(None, None);
        tracker.start_request(None, None);
        tracker.finish_request(true);

        let totals = tracker.snapshot().totals;
        assert_eq!(totals.total, 3);
        assert_eq!(totals.success, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.in_flight(), 0);
    }

    #[test]
    fn totals_hold_under_concurrent_requests() {
        let tracker = Arc::new(RequestTracker::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.start_request(None, None);
                        tracker.record_first_response();
                        let totals = tracker.snapshot().totals;
                        assert!(totals.success + totals.failed <= totals.total);
                        tracker.finish_request(i % 2 == 0);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let totals = tracker.snapshot().totals;
        assert_eq!(totals.total, 400);
        assert_eq!(totals.success + totals.failed, 400);
    }

    #[test]
    fn concurrent_changesets_are_atomic_but_unordered() {
        let tracker = Arc::new(RequestTracker::new());
        let totals_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = totals_seen.clone();
        tracker.subscribe(move |changes| {
            if let Some(change) = changes.get("totals.total") {
                sink.lock()
                    .unwrap()
                    .push((change.old.as_u64(), change.new.as_u64()));
            }
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.start_request(None, None);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let seen = totals_seen.lock().unwrap().clone();
        assert!(seen.iter().all(|(old, new)| new.zip(*old).is_some_and(|(n, o)| n == o + 1)));
        let mut totals: Vec<u64> = seen.iter().filter_map(|(_, new)| *new).collect();
        totals.sort_unstable();
        assert_eq!(totals, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn observers_receive_field_changes() {
        let tracker = RequestTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = tracker.subscribe(move |changes| sink.lock().unwrap().push(changes.clone()));

        tracker.start_request(Some("speech"), None);
        tracker.record_first_response();
        tracker.record_first_response();
        assert!(tracker.unsubscribe(id));
        assert!(!tracker.unsubscribe(id));
        tracker.finish_request(true);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["is_processing"].new, json!(true));
        assert_eq!(seen[0]["request_type"].new, json!("speech"));
        assert_eq!(seen[0]["totals.total"].new, json!(1));
        assert_eq!(seen[1].len(), 1);
        assert!(seen[1].contains_key("first_response_ms"));
        assert_eq!(tracker.snapshot().version, 3);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let tracker = RequestTracker::new();
        let calls = Arc::new(AtomicU64::new(0));
        tracker.subscribe(|_| panic!("observer bug"));
        let counter = calls.clone();
        tracker.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.start_request(None, None);
        tracker.finish_request(true);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.snapshot().totals.success, 1);
    }

    #[test]
    fn observer_may_read_tracker() {
        let tracker = Arc::new(RequestTracker::new());
        let inner = Arc::downgrade(&tracker);
        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        tracker.subscribe(move |_| {
            if let Some(tracker) = inner.upgrade() {
                sink.store(tracker.snapshot().version, Ordering::SeqCst);
            }
        });
        tracker.start_request(None, None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_cannot_touch_totals() {
        let tracker = RequestTracker::new();
        tracker.start_request(Some("speech"), None);
        tracker.update(|state| {
            state.request_type = Some("greeting".to_string());
            state.totals.total = 99;
        });
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.request_type.as_deref(), Some("greeting"));
        assert_eq!(snapshot.totals.total, 1);
    }

    #[test]
    fn reset_keeps_totals() {
        let tracker = RequestTracker::new();
        tracker.start_request(Some("speech"), backdated(5));
        tracker.record_first_audio();
        tracker.finish_request(false);
        tracker.reset();

        let snapshot = tracker.snapshot();
        assert!(snapshot.first_audio_ms.is_none());
        assert!(snapshot.request_type.is_none());
        assert_eq!(snapshot.totals.total, 1);
        assert_eq!(snapshot.totals.failed, 1);
    }

    #[test]
    fn attach_follows_bus_events() {
        let bus = EventBus::new();
        let tracker = Arc::new(RequestTracker::new());
        let subscriptions = tracker.attach(&bus);
        assert_eq!(subscriptions.len(), 4);

        tracker.start_request(Some("speech"), backdated(3));
        bus.publish(ClientEvent::StreamFirstByte);
        bus.publish(ClientEvent::StreamFrame { index: 0, len: 4096 });
        bus.publish(ClientEvent::PlaybackStarted);
        bus.publish(ClientEvent::RequestFinished { success: true });

        let snapshot = tracker.snapshot();
        assert!(snapshot.first_response_ms.is_some());
        assert!(snapshot.first_audio_ms.is_some());
        assert!(snapshot.playback_start_ms.is_some());
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.totals.success, 1);

        for (kind, id) in subscriptions {
            assert!(bus.unsubscribe(kind, id));
        }
    }

    #[test]
    fn later_frames_do_not_move_first_audio() {
        let bus = EventBus::new();
        let tracker = Arc::new(RequestTracker::new());
        tracker.attach(&bus);
        tracker.start_request(None, None);
        bus.publish(ClientEvent::StreamFrame { index: 3, len: 10 });
        assert!(tracker.snapshot().first_audio_ms.is_none());
    }
}
