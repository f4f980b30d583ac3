//! Parley CLI and listener endpoint entry point.
//!
//! Binary name: `parley`
//!
//! Parses CLI arguments, loads configuration, wires the coordination
//! components and dispatches to the command handler. `main` stays
//! synchronous: it is the owning thread that pumps marshaled events, while
//! async work lives on pool workers and the broadcast event loop.

mod cli;
mod http;
mod pipeline;
mod state;

use std::time::Duration;

use clap::Parser;
use parley_infra::config::{load_config, resolve_data_dir};
use parley_observe::tracing_setup::{LogFormat, init_tracing, verbosity_filter};

use cli::{Cli, Commands};
use state::AppState;

/// How long running tasks get to finish once a command is done.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, verbosity_filter(cli.verbose, cli.quiet))
        .map_err(|e| anyhow::anyhow!(e))?;

    let data_dir = resolve_data_dir();
    let mut config = load_config(&data_dir);
    if let Commands::Speak { url: Some(url), .. } = &cli.command {
        config.tts.url = url.clone();
    }

    let state = AppState::from_config(config, data_dir)?;
    let pump = state.bus.marshal_pump();

    let outcome = match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            cli::serve::serve(&state, pump.as_ref(), host, port, cli.json)
        }

        Commands::Speak { text, out, .. } => {
            cli::speak::speak(&state, pump.as_ref(), text, out, cli.json, cli.quiet)
        }

        Commands::Config => cli::config::show_config(&state, cli.json),
    };

    state.shutdown(SHUTDOWN_GRACE);
    outcome
}
