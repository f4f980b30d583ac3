//! `parley speak`: one tracked speech request from the terminal.
//!
//! The main thread owns the bus's marshal pump and drains it while the
//! request runs on a pool worker, so status lines print from this thread.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use console::style;
use parley_core::event::MarshalPump;
use parley_infra::sink::{DiscardSink, FileSink};
use parley_types::event::{ClientEvent, EventKind};
use parley_types::request::RequestState;

use crate::pipeline::submit_speech;
use crate::state::AppState;

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

pub fn speak(
    state: &AppState,
    pump: Option<&MarshalPump>,
    text: String,
    out: Option<PathBuf>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let status_sub = (!json && !quiet).then(|| {
        state.bus.subscribe(EventKind::Status, |event| {
            if let ClientEvent::Status { message } = event {
                println!("  {} {}", style("·").dim(), message);
            }
        })
    });

    let handle = match &out {
        Some(path) => submit_speech(state, text, FileSink::create(path)?)?,
        None => submit_speech(state, text, DiscardSink::default())?,
    };

    while !handle.is_finished() {
        match pump {
            Some(pump) => {
                pump.pump_timeout(PUMP_INTERVAL);
            }
            None => std::thread::sleep(PUMP_INTERVAL),
        }
    }
    let result = handle.join(None);
    if let Some(pump) = pump {
        pump.pump();
    }
    if let Some(id) = status_sub {
        state.bus.unsubscribe(EventKind::Status, id);
    }

    let snapshot = state.tracker.snapshot();
    if json {
        let report = serde_json::json!({
            "success": result.is_ok(),
            "summary": result.as_ref().ok(),
            "error": result.as_ref().err().map(ToString::to_string),
            "output": out.as_ref().map(|p| p.display().to_string()),
            "request": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_timings(&snapshot);
        if let Ok(summary) = &result {
            println!(
                "  {} {} frames, {} bytes",
                style("✓").green(),
                summary.frames,
                summary.bytes
            );
            if let Some(path) = &out {
                println!("  Audio written to {}", style(path.display()).cyan());
            }
        }
    }

    result?;
    Ok(())
}

fn print_timings(snapshot: &RequestState) {
    println!();
    println!("  {}", style("Timings").bold());
    for (label, value) in [
        ("first response", snapshot.first_response_ms),
        ("first audio", snapshot.first_audio_ms),
        ("playback start", snapshot.playback_start_ms),
    ] {
        println!("  {:<16} {}", label, format_ms(value));
    }
    let totals = snapshot.totals;
    println!(
        "  {:<16} {} total, {} ok, {} failed",
        "requests", totals.total, totals.success, totals.failed
    );
    println!();
}

fn format_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{ms:.1} ms"),
        None => style("-").dim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milliseconds_render_with_one_decimal() {
        assert_eq!(format_ms(Some(12.345)), "12.3 ms");
        assert!(format_ms(None).contains('-'));
    }
}
