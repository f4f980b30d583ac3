//! Configuration loader for Parley.
//!
//! Reads `config.toml` from the data directory (`~/.parley/` in production)
//! and deserializes it into [`ClientConfig`]. Falls back to defaults when the
//! file is missing or malformed, so a bad edit never stops the client.

use std::path::{Path, PathBuf};

use parley_types::config::ClientConfig;

pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the data directory.
///
/// Priority:
/// 1. `PARLEY_DATA_DIR` environment variable
/// 2. `~/.parley`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".parley");
    }
    PathBuf::from(".parley")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load `{data_dir}/config.toml`, normalized.
///
/// Blocking; called once at startup before any runtime exists.
pub fn load_config(data_dir: &Path) -> ClientConfig {
    let path = config_path(data_dir);

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return ClientConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ClientConfig::default();
        }
    };

    match toml::from_str::<ClientConfig>(&content) {
        Ok(config) => {
            let normalized = config.clone().normalized();
            if normalized != config {
                tracing::warn!(
                    workers = normalized.workers,
                    frame_size = normalized.frame_size,
                    "Clamped out-of-range values in {}",
                    path.display()
                );
            }
            normalized
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            ClientConfig::default()
        }
    }
}

/// Render `config` as TOML, e.g. for `parley config`.
pub fn render_config(config: &ClientConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
