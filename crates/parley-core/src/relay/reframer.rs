use parley_types::error::RelayError;

/// Pure state machine that turns arbitrary chunks into fixed-size frames.
///
/// The first `header_size` bytes of the stream are discarded exactly once,
/// however the chunks happen to split them.
#[derive(Debug)]
pub struct Reframer {
    header_size: usize,
    frame_size: usize,
    buffer: Vec<u8>,
    header_done: bool,
    received: u64,
}

impl Reframer {
    pub fn new(header_size: usize, frame_size: usize) -> Self {
        Self {
            header_size,
            frame_size: frame_size.max(1),
            buffer: Vec::new(),
            header_done: header_size == 0,
            received: 0,
        }
    }

    /// Feed one chunk; returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        if !self.header_done {
            if self.buffer.len() < self.header_size {
                return Vec::new();
            }
            self.buffer.drain(..self.header_size);
            self.header_done = true;
        }

        let whole = self.buffer.len() / self.frame_size * self.frame_size;
        if whole == 0 {
            return Vec::new();
        }
        let rest = self.buffer.split_off(whole);
        let frames = self
            .buffer
            .chunks_exact(self.frame_size)
            .map(<[u8]>::to_vec)
            .collect();
        self.buffer = rest;
        frames
    }

    /// End of stream: the short trailing frame, if any.
    ///
    /// Fails when the stream ended before the header was complete.
    pub fn finish(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if !self.header_done {
            return Err(RelayError::MalformedStream {
                received: self.received,
                needed: self.header_size,
            });
        }
        if self.buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }

    /// Total bytes pushed so far, header included.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn header_done(&self) -> bool {
        self.header_done
    }
}
