//! Streaming TTS source over HTTP.
//!
//! [`HttpChunkSource`] posts the text to the TTS backend and exposes the
//! chunked response body as a blocking [`ChunkSource`]. The reqwest stream is
//! driven by a current-thread runtime owned by the source, so it must be used
//! from a plain worker thread (a `TaskPool::submit` body), never from inside
//! another runtime.
//!
//! Every body read races the owning task's cancellation token and the
//! configured read timeout, so a stalled backend cannot pin the worker.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parley_core::relay::ChunkSource;
use parley_types::config::TtsConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

/// Body of the TTS request.
#[derive(Debug, Clone, Serialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>, config: &TtsConfig) -> Self {
        Self {
            text: text.into(),
            voice: config.voice.clone(),
        }
    }
}

/// Failure to open the response stream.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[from] io::Error),

    #[error("TTS request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TTS backend answered {status}: {body}")]
    Status { status: u16, body: String },
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

pub struct HttpChunkSource {
    runtime: Runtime,
    body: ByteStream,
    cancel: CancellationToken,
    read_timeout: Duration,
    url: String,
}

impl HttpChunkSource {
    /// Send the request and wait for the response headers.
    ///
    /// `cancel` is the owning task's token; reads return `Interrupted` once
    /// it fires.
    pub fn open(
        config: &TtsConfig,
        request: &TtsRequest,
        cancel: &CancellationToken,
    ) -> Result<Self, SourceError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;

        tracing::debug!(url = %config.url, chars = request.text.len(), "Opening TTS stream");
        let response = runtime.block_on(client.post(&config.url).json(request).send())?;

        let status = response.status();
        if !status.is_success() {
            let body = runtime.block_on(response.text()).unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec())),
        );
        Ok(Self {
            runtime,
            body,
            cancel: cancel.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            url: config.url.clone(),
        })
    }
}

impl ChunkSource for HttpChunkSource {
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Self {
            runtime,
            body,
            cancel,
            read_timeout,
            url,
        } = self;

        let next = runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "TTS stream read cancelled",
                )),
                next = tokio::time::timeout(*read_timeout, body.next()) => next.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no TTS data for {} ms", read_timeout.as_millis()),
                    )
                }),
            }
        })?;

        next.transpose().map_err(|err| {
            tracing::debug!(url = %url, error = %err, "TTS stream read failed");
            io::Error::other(err)
        })
    }
}

impl std::fmt::Debug for HttpChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChunkSource")
            .field("url", &self.url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Read one HTTP/1.1 request and return its body.
    fn read_request(stream: &TcpStream) -> String {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();
        String::from_utf8(body).unwrap()
    }

    /// Serve one canned HTTP/1.1 response and return the request body seen.
    fn serve_once(status: &'static str, chunks: Vec<Vec<u8>>) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/tts", listener.local_addr().unwrap());

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let body = read_request(&stream);

            let mut writer = stream;
            write!(
                writer,
                "HTTP/1.1 {status}\r\ncontent-type: audio/wav\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n"
            )
            .unwrap();
            for chunk in chunks {
                write!(writer, "{:x}\r\n", chunk.len()).unwrap();
                writer.write_all(&chunk).unwrap();
                writer.write_all(b"\r\n").unwrap();
                writer.flush().unwrap();
            }
            writer.write_all(b"0\r\n\r\n").unwrap();
            writer.flush().unwrap();
            body
        });
        (url, server)
    }

    /// Answer with headers and one chunk, then hold the connection open
    /// until `release` fires.
    fn serve_stalled(release: std::sync::mpsc::Receiver<()>) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/tts", listener.local_addr().unwrap());

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            read_request(&stream);

            let mut writer = stream;
            writer
                .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nRIFF\r\n")
                .unwrap();
            writer.flush().unwrap();
            let _ = release.recv_timeout(std::time::Duration::from_secs(10));
        });
        (url, server)
    }

    fn config(url: String) -> TtsConfig {
        TtsConfig {
            url,
            voice: Some("alto".to_string()),
            connect_timeout_ms: 2_000,
            read_timeout_ms: 5_000,
        }
    }

    #[test]
    fn streams_response_body_in_order() {
        let chunks = vec![vec![1u8; 10], vec![2u8; 300], vec![3u8; 7]];
        let (url, server) = serve_once("200 OK", chunks.clone());
        let config = config(url);

        let mut source = HttpChunkSource::open(&config, &TtsRequest::new("hello", &config), &CancellationToken::new()).unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            received.extend(chunk);
        }

        assert_eq!(received, chunks.concat());
        let body: serde_json::Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(body["text"], "hello");
        assert_eq!(body["voice"], "alto");
    }

    #[test]
    fn error_status_is_reported() {
        let (url, server) = serve_once("503 Service Unavailable", vec![b"model loading".to_vec()]);
        let config = config(url);

        let err = HttpChunkSource::open(&config, &TtsRequest::new("hi", &config), &CancellationToken::new()).unwrap_err();
        match err {
            SourceError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model loading");
            }
            other => panic!("expected Status, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn unreachable_backend_fails_to_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/tts", listener.local_addr().unwrap());
        drop(listener);
        let config = config(url);

        let err = HttpChunkSource::open(&config, &TtsRequest::new("hi", &config), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SourceError::Http(_)));
    }

    #[test]
    fn cancellation_interrupts_stalled_read() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let (url, server) = serve_stalled(release_rx);
        let config = config(url);
        let token = CancellationToken::new();

        let mut source = HttpChunkSource::open(&config, &TtsRequest::new("hi", &config), &token).unwrap();
        assert_eq!(source.next_chunk().unwrap(), Some(b"RIFF".to_vec()));

        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = source.next_chunk().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        release_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn stalled_read_times_out() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let (url, server) = serve_stalled(release_rx);
        let mut config = config(url);
        config.read_timeout_ms = 100;

        let mut source =
            HttpChunkSource::open(&config, &TtsRequest::new("hi", &config), &CancellationToken::new()).unwrap();
        assert_eq!(source.next_chunk().unwrap(), Some(b"RIFF".to_vec()));

        let err = source.next_chunk().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        release_tx.send(()).unwrap();
        server.join().unwrap();
    }
}
