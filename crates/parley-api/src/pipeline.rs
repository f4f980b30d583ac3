//! One speech request: open the TTS stream and relay it into a sink on a
//! pool worker.
//!
//! The request is started on the tracker at submission time. Exactly one
//! `RequestFinished` follows on every path, which the tracker (attached to
//! the bus) turns into `finish_request`: the body publishes it when it
//! returns, and a guard captured by the body publishes a failure when the
//! body is dropped unrun (cancelled while queued, drained by shutdown,
//! refused at submit) or unwinds.

use std::time::Duration;

use parley_core::event::EventBus;
use parley_core::guard::retry;
use parley_core::pool::{TaskContext, TaskHandle};
use parley_core::relay::{ChunkSource, PlaybackSink, RelaySummary, StreamingRelay};
use parley_infra::http::{HttpChunkSource, TtsRequest};
use parley_types::error::{Cancelled, PoolError, RelayError};
use parley_types::event::ClientEvent;

use crate::state::AppState;

pub const SPEECH_REQUEST: &str = "speech";

const OPEN_ATTEMPTS: u32 = 2;
const OPEN_BACKOFF: Duration = Duration::from_millis(250);

/// Speak `text` through the configured TTS backend into `sink`.
pub fn submit_speech<K>(
    state: &AppState,
    text: String,
    sink: K,
) -> Result<TaskHandle<RelaySummary>, PoolError>
where
    K: PlaybackSink + Send + 'static,
{
    let tts = state.config.tts.clone();
    let request = TtsRequest::new(text, &tts);
    submit_relay(
        state,
        SPEECH_REQUEST,
        move |ctx: &TaskContext| Ok(HttpChunkSource::open(&tts, &request, ctx.token())?),
        sink,
    )
}

/// Start a tracked request that relays the source built by `open` into `sink`.
pub fn submit_relay<S, K, O>(
    state: &AppState,
    request_type: &str,
    open: O,
    sink: K,
) -> Result<TaskHandle<RelaySummary>, PoolError>
where
    S: ChunkSource,
    K: PlaybackSink + Send + 'static,
    O: FnMut(&TaskContext) -> anyhow::Result<S> + Send + 'static,
{
    state.tracker.start_request(Some(request_type), None);

    let bus = state.bus.clone();
    let status = state.status.clone();
    let relay = StreamingRelay::from_config(bus.clone(), &state.config);
    let stage = request_type.to_string();
    let mut open = open;
    let mut sink = sink;

    let finished = FinishGuard {
        bus: bus.clone(),
        stage: stage.clone(),
        done: false,
    };

    let submitted = state.pool.submit(None, move |ctx| {
        status.post("Contacting speech backend");
        let outcome = relay_once(&ctx, &relay, &stage, &mut open, &mut sink);

        match &outcome {
            Ok(summary) => {
                status.post(format!("Played {} frames", summary.frames));
            }
            Err(err) => {
                let cause = format!("{err:#}");
                tracing::warn!(task = %ctx.name(), stage = %stage, error = %cause, "Request failed");
                bus.publish(ClientEvent::error(&stage, cause));
                status.post("Request failed");
            }
        }
        status.flush();
        finished.finish(outcome.is_ok());
        outcome
    });

    if let Err(err) = &submitted {
        tracing::warn!(error = %err, "Could not submit request");
    }
    submitted
}

/// Publishes the request's `RequestFinished`.
///
/// Dropped without [`finish`](Self::finish), it reports the request as failed.
struct FinishGuard {
    bus: EventBus,
    stage: String,
    done: bool,
}

impl FinishGuard {
    fn finish(mut self, success: bool) {
        self.done = true;
        self.bus.publish(ClientEvent::RequestFinished { success });
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::warn!(stage = %self.stage, "Request ended without running to completion");
        self.bus.publish(ClientEvent::error(
            &self.stage,
            "request ended before it ran to completion",
        ));
        self.bus
            .publish(ClientEvent::RequestFinished { success: false });
    }
}

fn relay_once<S, K, O>(
    ctx: &TaskContext,
    relay: &StreamingRelay,
    stage: &str,
    open: &mut O,
    sink: &mut K,
) -> anyhow::Result<RelaySummary>
where
    S: ChunkSource,
    K: PlaybackSink,
    O: FnMut(&TaskContext) -> anyhow::Result<S>,
{
    let mut source = retry(stage, OPEN_ATTEMPTS, OPEN_BACKOFF, |_| {
        ctx.checkpoint()?;
        open(ctx)
    })?;

    match relay.run(&mut source, sink, ctx.token()) {
        Ok(summary) => Ok(summary),
        Err(RelayError::Cancelled) => Err(Cancelled.into()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::relay::IterSource;
    use parley_infra::sink::DiscardSink;
    use parley_types::config::ClientConfig;
    use parley_types::event::EventKind;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    fn state() -> AppState {
        state_with_workers(2)
    }

    fn state_with_workers(workers: usize) -> AppState {
        let config = ClientConfig {
            workers,
            frame_size: 8,
            ..ClientConfig::default()
        };
        let tmp = std::env::temp_dir();
        AppState::from_config(config, tmp).unwrap()
    }

    fn errors(state: &AppState) -> Arc<Mutex<Vec<ClientEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        state
            .bus
            .subscribe(EventKind::Error, move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn successful_relay_finishes_request() {
        let state = state();
        let mut stream = vec![0u8; 44];
        stream.extend([1u8; 24]);

        let handle = submit_relay(
            &state,
            "test",
            move |_: &TaskContext| Ok(IterSource::from_chunks(vec![stream.clone()])),
            DiscardSink::default(),
        )
        .unwrap();
        let summary = handle.join(Some(Duration::from_secs(5))).unwrap();

        assert_eq!(summary.frames, 3);
        let snapshot = state.tracker.snapshot();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.totals.success, 1);
        assert_eq!(snapshot.request_type.as_deref(), Some("test"));
        assert!(snapshot.first_response_ms.is_some());
        assert!(snapshot.first_audio_ms.is_some());
        assert!(snapshot.playback_start_ms.is_some());
    }

    #[test]
    fn malformed_stream_fails_request_and_reports() {
        let state = state();
        let seen = errors(&state);

        let handle = submit_relay(
            &state,
            "test",
            |_: &TaskContext| Ok(IterSource::from_chunks(vec![vec![0u8; 10]])),
            DiscardSink::default(),
        )
        .unwrap();
        let err = handle.join(Some(Duration::from_secs(5))).unwrap_err();

        assert!(matches!(err, PoolError::Failed { ref message, .. } if message.contains("malformed")));
        assert_eq!(state.tracker.snapshot().totals.failed, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn source_open_is_retried() {
        let state = state();
        let mut attempts = 0;
        let handle = submit_relay(
            &state,
            "test",
            move |_: &TaskContext| {
                attempts += 1;
                if attempts == 1 {
                    anyhow::bail!("connection refused");
                }
                Ok(IterSource::from_chunks(vec![vec![0u8; 52]]))
            },
            DiscardSink::default(),
        )
        .unwrap();

        assert_eq!(handle.join(Some(Duration::from_secs(5))).unwrap().frames, 1);
        assert_eq!(state.tracker.snapshot().totals.success, 1);
    }

    #[test]
    fn submit_after_shutdown_counts_failure() {
        let state = state();
        assert!(state.shutdown(Duration::from_secs(5)));
        let seen = errors(&state);

        let err = submit_relay(
            &state,
            "test",
            |_: &TaskContext| Ok(IterSource::from_chunks(Vec::new())),
            DiscardSink::default(),
        )
        .unwrap_err();

        assert_eq!(err, PoolError::Closed);
        let totals = state.tracker.snapshot().totals;
        assert_eq!((totals.total, totals.failed), (1, 1));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    /// Occupy the only worker until the returned sender fires.
    fn block_worker(state: &AppState) -> mpsc::Sender<()> {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        state
            .pool
            .submit(Some("blocker"), move |_| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn request_cancelled_before_start_is_finished() {
        let state = state_with_workers(1);
        let seen = errors(&state);
        let release = block_worker(&state);

        let handle = submit_relay(
            &state,
            "test",
            |_: &TaskContext| Ok(IterSource::from_chunks(vec![vec![0u8; 52]])),
            DiscardSink::default(),
        )
        .unwrap();
        assert!(state.pool.cancel(handle.name()));
        release.send(()).unwrap();

        assert!(matches!(
            handle.join(Some(Duration::from_secs(5))),
            Err(PoolError::Cancelled(_))
        ));
        let snapshot = state.tracker.snapshot();
        assert!(!snapshot.is_processing);
        let totals = snapshot.totals;
        assert_eq!((totals.total, totals.success, totals.failed), (1, 0, 1));
        assert_eq!(seen.lock().unwrap().len(), 1);

        // The tracker is free for the next request.
        let next = submit_relay(
            &state,
            "test",
            |_: &TaskContext| Ok(IterSource::from_chunks(vec![vec![0u8; 52]])),
            DiscardSink::default(),
        )
        .unwrap();
        assert_eq!(next.join(Some(Duration::from_secs(5))).unwrap().frames, 1);
        assert_eq!(state.tracker.snapshot().totals.success, 1);
    }

    #[test]
    fn request_drained_by_shutdown_is_finished() {
        let state = state_with_workers(1);
        let release = block_worker(&state);

        let handle = submit_relay(
            &state,
            "test",
            |_: &TaskContext| Ok(IterSource::from_chunks(vec![vec![0u8; 52]])),
            DiscardSink::default(),
        )
        .unwrap();
        assert!(!state.shutdown(Duration::from_millis(50)));

        assert!(matches!(
            handle.join(Some(Duration::from_secs(5))),
            Err(PoolError::Cancelled(_))
        ));
        let snapshot = state.tracker.snapshot();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.totals.failed, 1);
        release.send(()).unwrap();
    }
}
