//! `parley config`: print the effective configuration.

use anyhow::Result;
use console::style;
use parley_infra::config::{config_path, render_config};

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "config": &*state.config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let path = config_path(&state.data_dir);
    println!();
    println!(
        "  {} {}{}",
        style("Config").bold(),
        style(path.display()).cyan(),
        if path.exists() { "" } else { " (not found, defaults)" }
    );
    println!();
    for line in render_config(&state.config)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
