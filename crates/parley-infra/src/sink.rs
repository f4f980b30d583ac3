//! Playback sinks.
//!
//! Real audio output is a collaborator outside this workspace; these sinks
//! cover the cases the client itself needs: raw PCM to a file, frames handed
//! to another thread through a bounded channel, and a counting sink for
//! dry runs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use parley_core::relay::PlaybackSink;
use parley_types::error::SinkError;

/// Appends raw PCM frames to a file.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            writer,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl PlaybackSink for FileSink {
    fn write(&mut self, frame: Vec<u8>) -> Result<(), SinkError> {
        self.writer.write_all(&frame)?;
        self.written += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        tracing::debug!(path = %self.path.display(), bytes = self.written, "Audio written");
        Ok(())
    }
}

/// Hands frames to a consumer thread, blocking while the channel is full.
pub struct ChannelSink {
    frames: SyncSender<Vec<u8>>,
}

impl ChannelSink {
    /// A sink plus the receiving end, holding at most `capacity` frames.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (frames, rx) = sync_channel(capacity);
        (Self { frames }, rx)
    }
}

impl PlaybackSink for ChannelSink {
    fn write(&mut self, frame: Vec<u8>) -> Result<(), SinkError> {
        self.frames.send(frame).map_err(|_| SinkError::Closed)
    }
}

/// Accepts and counts every frame.
#[derive(Debug, Default)]
pub struct DiscardSink {
    pub frames: u64,
    pub bytes: u64,
}

impl PlaybackSink for DiscardSink {
    fn write(&mut self, frame: Vec<u8>) -> Result<(), SinkError> {
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_sink_writes_frames_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("reply.pcm");
        let mut sink = FileSink::create(&path).unwrap();

        sink.write(vec![1, 2, 3]).unwrap();
        sink.write(vec![4]).unwrap();
        sink.finish().unwrap();

        assert_eq!(sink.written(), 4);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        sink.write(vec![7; 4]).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![7; 4]);

        drop(rx);
        assert!(matches!(sink.write(vec![1]), Err(SinkError::Closed)));
    }

    #[test]
    fn channel_sink_applies_backpressure() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        let producer = std::thread::spawn(move || {
            for i in 0..5u8 {
                sink.write(vec![i]).unwrap();
            }
        });
        let received: Vec<Vec<u8>> = rx.iter().take(5).collect();
        producer.join().unwrap();
        assert_eq!(received, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[test]
    fn discard_sink_counts() {
        let mut sink = DiscardSink::default();
        sink.write(vec![0; 10]).unwrap();
        sink.write(vec![0; 5]).unwrap();
        assert_eq!((sink.frames, sink.bytes), (2, 15));
    }
}
