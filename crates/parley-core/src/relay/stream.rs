use parley_types::config::ClientConfig;
use parley_types::error::RelayError;
use parley_types::event::ClientEvent;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{ChunkSource, PlaybackSink, Reframer};
use crate::event::EventBus;

/// Counters for one completed relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    /// Frames accepted by the sink.
    pub frames: u64,
    /// Payload bytes accepted by the sink.
    pub bytes: u64,
    /// Bytes read from the source, header included.
    pub received: u64,
}

/// Moves one stream from a [`ChunkSource`] into a [`PlaybackSink`].
///
/// Publishes `StreamFirstByte`, one `StreamFrame` per frame, `PlaybackStarted`
/// after the first accepted frame, then either `StreamEnd` or exactly one
/// `StreamError`. Never retries; callers that want another attempt submit a
/// new relay.
#[derive(Debug, Clone)]
pub struct StreamingRelay {
    bus: EventBus,
    header_size: usize,
    frame_size: usize,
}

impl StreamingRelay {
    pub fn new(bus: EventBus, header_size: usize, frame_size: usize) -> Self {
        Self {
            bus,
            header_size,
            frame_size: frame_size.max(1),
        }
    }

    pub fn from_config(bus: EventBus, config: &ClientConfig) -> Self {
        Self::new(bus, config.header_size, config.frame_size)
    }

    pub fn run<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<RelaySummary, RelayError>
    where
        S: ChunkSource + ?Sized,
        K: PlaybackSink + ?Sized,
    {
        let result = self.relay(source, sink, cancel);
        match &result {
            Ok(summary) => {
                tracing::debug!(
                    frames = summary.frames,
                    bytes = summary.bytes,
                    received = summary.received,
                    "Relay finished"
                );
                self.bus.publish(ClientEvent::StreamEnd {
                    frames: summary.frames,
                    bytes: summary.bytes,
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "Relay stopped");
                self.bus.publish(ClientEvent::StreamError {
                    failure: err.failure(),
                    cause: err.to_string(),
                });
            }
        }
        result
    }

    fn relay<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<RelaySummary, RelayError>
    where
        S: ChunkSource + ?Sized,
        K: PlaybackSink + ?Sized,
    {
        let mut reframer = Reframer::new(self.header_size, self.frame_size);
        let mut summary = RelaySummary::default();
        let mut first_byte = false;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let chunk = match source.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                // A blocked read interrupted by the owning task's token.
                Err(_) if cancel.is_cancelled() => return Err(RelayError::Cancelled),
                Err(err) => return Err(RelayError::Source(err.to_string())),
            };
            if chunk.is_empty() {
                continue;
            }
            if !first_byte {
                first_byte = true;
                self.bus.publish(ClientEvent::StreamFirstByte);
            }

            for frame in reframer.push(&chunk) {
                self.deliver(frame, sink, &mut summary)?;
            }
            summary.received = reframer.received();
        }

        if let Some(tail) = reframer.finish()? {
            self.deliver(tail, sink, &mut summary)?;
        }
        sink.finish()
            .map_err(|err| RelayError::Sink(err.to_string()))?;
        Ok(summary)
    }

    fn deliver<K>(
        &self,
        frame: Vec<u8>,
        sink: &mut K,
        summary: &mut RelaySummary,
    ) -> Result<(), RelayError>
    where
        K: PlaybackSink + ?Sized,
    {
        let len = frame.len();
        self.bus.publish(ClientEvent::StreamFrame {
            index: summary.frames,
            len,
        });
        sink.write(frame)
            .map_err(|err| RelayError::Sink(err.to_string()))?;

        if summary.frames == 0 {
            self.bus.publish(ClientEvent::PlaybackStarted);
        }
        summary.frames += 1;
        summary.bytes += len as u64;
        Ok(())
    }
}
