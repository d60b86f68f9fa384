//! Error types for want replication

use blobs_core::{BlobRef, StoreError};
use thiserror::Error;

use crate::codec::DecodeError;

/// Errors surfaced to callers of the manager and sessions
#[derive(Debug, Error)]
pub enum WantError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed want list: {0}")]
    Decode(#[from] DecodeError),

    /// Local wants are requests; sizes are only ever advertised by peers
    #[error("want distance must be negative, got {0}")]
    InvalidDistance(i64),

    #[error("sending to peer failed: {0:#}")]
    Sink(anyhow::Error),

    #[error("want session is closed")]
    Closed,

    #[error("want sessions must be created inside a tokio runtime")]
    NoRuntime,
}

/// Failure of one background fetch. Logged by the fetch task, never
/// returned to protocol callers.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blob request failed: {0:#}")]
    Rpc(anyhow::Error),

    #[error("reading blob stream: {0}")]
    Read(#[from] std::io::Error),

    #[error("blob is larger than the fetch limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("fetched content hashes to {actual}, expected {expected}")]
    IntegrityMismatch { expected: BlobRef, actual: BlobRef },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("fetch task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}
