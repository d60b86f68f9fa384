//! Store operations: put, get, rm, size, ls, has

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use blobs_core::BlobStore;
use owo_colors::OwoColorize;
use tracing::debug;

use super::{open_input, parse_ref};
use crate::config::Config;

fn open_store(config: &Config) -> Result<BlobStore> {
    debug!(path = %config.store.path.display(), "opening store");
    config.store.open().with_context(|| {
        format!(
            "Failed to open blob store at {}",
            config.store.path.display()
        )
    })
}

pub fn put(config: &Config, file: Option<&Path>) -> Result<ExitCode> {
    let store = open_store(config)?;
    let blob = store.put(open_input(file)?).context("Failed to store blob")?;
    println!("{blob}");
    Ok(ExitCode::SUCCESS)
}

pub fn get(config: &Config, reference: &str, output: Option<&Path>) -> Result<ExitCode> {
    let blob = parse_ref(reference)?;
    let store = open_store(config)?;
    let mut content = store.get(&blob)?;

    match output {
        Some(path) => {
            let mut out = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            io::copy(&mut content, &mut out)?;
            out.sync_all()?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(&mut content, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn rm(config: &Config, reference: &str) -> Result<ExitCode> {
    let blob = parse_ref(reference)?;
    open_store(config)?.delete(&blob)?;
    println!("{} {}", "Removed".green(), blob);
    Ok(ExitCode::SUCCESS)
}

pub fn size(config: &Config, reference: &str) -> Result<ExitCode> {
    let blob = parse_ref(reference)?;
    println!("{}", open_store(config)?.size(&blob)?);
    Ok(ExitCode::SUCCESS)
}

pub fn ls(config: &Config) -> Result<ExitCode> {
    let store = open_store(config)?;
    let mut stdout = io::stdout().lock();
    for blob in store.list() {
        writeln!(stdout, "{}", blob?)?;
    }
    Ok(ExitCode::SUCCESS)
}

pub fn has(config: &Config, reference: &str) -> Result<ExitCode> {
    let blob = parse_ref(reference)?;
    if open_store(config)?.has(&blob)? {
        println!("{}", "present".green());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", "absent".yellow());
        Ok(ExitCode::FAILURE)
    }
}
