//! Client configuration types for Parley.
//!
//! `ClientConfig` represents the `config.toml` that sizes the worker pool,
//! shapes the audio framing and tunes listener delivery. All fields have
//! sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum number of pool workers.
pub const MIN_WORKERS: usize = 1;

/// Header length of a canonical WAV container.
pub const WAV_HEADER_SIZE: usize = 44;

/// Top-level configuration for the Parley client.
///
/// Loaded from `~/.parley/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Number of worker threads in the task pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Size in bytes of each audio frame handed to the playback sink.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Leading container header discarded once per stream.
    #[serde(default = "default_header_size")]
    pub header_size: usize,

    /// Minimum spacing between UI status updates.
    #[serde(default = "default_status_debounce_ms")]
    pub status_debounce_ms: u64,

    /// Per-listener send deadline before the listener is dropped.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Text-to-speech backend that streams the audio response.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Listener endpoint settings for `parley serve`.
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_workers() -> usize {
    3
}

fn default_frame_size() -> usize {
    4096
}

fn default_header_size() -> usize {
    WAV_HEADER_SIZE
}

fn default_status_debounce_ms() -> u64 {
    250
}

fn default_delivery_timeout_ms() -> u64 {
    2_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            frame_size: default_frame_size(),
            header_size: default_header_size(),
            status_debounce_ms: default_status_debounce_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            tts: TtsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Clamp values that would make the pool or the framer unusable.
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(MIN_WORKERS);
        self.frame_size = self.frame_size.max(1);
        self
    }

    pub fn status_debounce(&self) -> Duration {
        Duration::from_millis(self.status_debounce_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Text-to-speech backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Endpoint accepting `POST {"text": ..}` and answering with chunked WAV.
    #[serde(default = "default_tts_url")]
    pub url: String,

    /// Optional voice identifier forwarded to the backend.
    #[serde(default)]
    pub voice: Option<String>,

    /// Connect timeout for the streaming request.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Longest wait for the next body chunk once streaming has begun.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_tts_url() -> String {
    "http://127.0.0.1:5002/api/tts".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    15_000
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            voice: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Listener endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.frame_size, 4096);
        assert_eq!(config.header_size, 44);
        assert_eq!(config.status_debounce(), Duration::from_millis(250));
        assert_eq!(config.server.port, 7420);
        assert!(config.tts.voice.is_none());
    }

    #[test]
    fn test_client_config_deserialize_with_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_client_config_deserialize_with_values() {
        let toml_str = r#"
workers = 5
frame_size = 1024
delivery_timeout_ms = 500

[tts]
url = "http://tts.local/stream"
voice = "alto"

[server]
port = 9000
"#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.frame_size, 1024);
        assert_eq!(config.header_size, 44);
        assert_eq!(config.delivery_timeout(), Duration::from_millis(500));
        assert_eq!(config.tts.url, "http://tts.local/stream");
        assert_eq!(config.tts.voice.as_deref(), Some("alto"));
        assert_eq!(config.tts.connect_timeout_ms, 5_000);
        assert_eq!(config.tts.read_timeout_ms, 15_000);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_normalized_enforces_minimums() {
        let config = ClientConfig {
            workers: 0,
            frame_size: 0,
            ..ClientConfig::default()
        }
        .normalized();
        assert_eq!(config.workers, MIN_WORKERS);
        assert_eq!(config.frame_size, 1);
    }
}
