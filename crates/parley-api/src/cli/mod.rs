//! CLI command definitions for the `parley` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod config;
pub mod serve;
pub mod speak;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Voice-agent client: stream speech and relay events to listeners.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, env = "PARLEY_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the listener endpoint (websocket events + JSON API).
    Serve {
        /// Address to bind (defaults to `server.host` in config.toml).
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (defaults to `server.port` in config.toml).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Speak one line of text through the TTS backend.
    Speak {
        /// Text to synthesize.
        text: String,

        /// Override the TTS endpoint URL.
        #[arg(long)]
        url: Option<String>,

        /// Write raw PCM frames to this file instead of discarding them.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["parley", "speak", "hello", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Speak { ref text, .. } if text == "hello"));
    }
}
