//! CLI command implementations

pub mod blob;
pub mod config;
pub mod wants;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use blobs_core::BlobRef;

/// Parse a blob reference given on the command line
pub(crate) fn parse_ref(reference: &str) -> Result<BlobRef> {
    reference
        .parse()
        .with_context(|| format!("Invalid blob reference: {reference}"))
}

/// Open `file`, or stdin when `None`
pub(crate) fn open_input(file: Option<&Path>) -> Result<Box<dyn Read>> {
    match file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdin().lock())),
    }
}
