//! Want message inspection

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use blobs_wants::WantList;
use owo_colors::OwoColorize;

use super::open_input;

/// Decode a want message with the wire decoder and describe each entry
pub fn check(file: Option<&Path>) -> Result<ExitCode> {
    let mut input = Vec::new();
    open_input(file)?
        .read_to_end(&mut input)
        .context("Failed to read want message")?;

    let wants = WantList::decode(&input).context("Malformed want message")?;
    if wants.is_empty() {
        println!("{}", "(empty want list)".dimmed());
    }
    for entry in wants.entries() {
        if entry.is_request() {
            let hops = format!("({} hops)", entry.distance.unsigned_abs());
            println!("{}  {} {}", entry.blob, "want".yellow(), hops.dimmed());
        } else {
            let size = format!("({} bytes)", entry.distance);
            println!("{}  {} {}", entry.blob, "have".green(), size.dimmed());
        }
    }
    Ok(ExitCode::SUCCESS)
}
