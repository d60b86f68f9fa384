//! Blobs Core - content-addressed blob storage
//!
//! This crate provides the storage layer:
//! - SHA-256 blob references and incremental hashing
//! - Write-once on-disk blob store with a sharded layout
//! - Synchronous change feed for put/remove events

pub mod changes;
pub mod config;
pub mod error;
pub mod hash;
pub mod store;

// Re-export main types for convenience
pub use changes::{Cancel, ChangeNotifier, StoreEvent, StoreOp};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use hash::{Algorithm, BlobRef, RefError, RefHasher};
pub use store::BlobStore;
