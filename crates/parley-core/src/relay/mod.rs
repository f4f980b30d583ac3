//! Re-framing a chunked audio stream into fixed-size playback frames.
//!
//! A TTS backend answers with a WAV container delivered in arbitrarily sized
//! chunks. The relay drops the container header once, cuts the remaining PCM
//! into `frame_size` frames and hands each one to a [`PlaybackSink`], pacing
//! itself on the sink. Progress is published on the event bus.

mod reframer;
mod stream;

pub use reframer::Reframer;
pub use stream::{RelaySummary, StreamingRelay};

use std::io;

use parley_types::error::SinkError;

/// Pull-based source of stream chunks.
///
/// `Ok(None)` marks the end of the stream. Empty chunks are allowed and
/// ignored.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Synchronous consumer of audio frames.
///
/// `write` blocks until the frame is accepted, which is what paces the relay.
pub trait PlaybackSink {
    fn write(&mut self, frame: Vec<u8>) -> Result<(), SinkError>;

    /// Called once after the last frame of a successful stream.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// [`ChunkSource`] over any iterator of chunk results.
pub struct IterSource<I> {
    chunks: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    pub fn new(chunks: I) -> Self {
        Self { chunks }
    }
}

impl IterSource<std::vec::IntoIter<io::Result<Vec<u8>>>> {
    /// A source that yields `chunks` in order and then ends.
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(chunks.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }
}

impl<I> ChunkSource for IterSource<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.chunks.next().transpose()
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for Box<S> {
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        (**self).next_chunk()
    }
}

impl<K: PlaybackSink + ?Sized> PlaybackSink for Box<K> {
    fn write(&mut self, frame: Vec<u8>) -> Result<(), SinkError> {
        (**self).write(frame)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }
}
