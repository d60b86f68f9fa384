//! Store error taxonomy

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hash::{BlobRef, RefError};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested blob is not in the store
    #[error("no such blob: {0}")]
    NotFound(BlobRef),

    #[error("invalid blob reference: {0}")]
    InvalidReference(#[from] RefError),

    /// Filesystem failure, with the operation and path that failed
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
