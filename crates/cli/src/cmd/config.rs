//! Effective configuration display

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;

use crate::config::{self, Config};

/// Print the merged configuration as TOML
pub fn show(config: &Config, explicit: Option<&Path>) -> Result<ExitCode> {
    let location = explicit.map(Path::to_path_buf).or_else(config::default_path);
    match location {
        Some(path) if path.exists() => {
            println!("{}", format!("# loaded from {}", path.display()).dimmed())
        }
        Some(path) => println!(
            "{}",
            format!("# {} not found, using defaults", path.display()).dimmed()
        ),
        None => println!("{}", "# no config directory, using defaults".dimmed()),
    }

    let text = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{text}");
    Ok(ExitCode::SUCCESS)
}
