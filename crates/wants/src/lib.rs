//! Blobs Wants - want/have replication of blobs between peers
//!
//! This crate provides the gossip layer on top of `blobs-core`:
//! - Strict codec for want list messages
//! - Local want set cleared by store puts
//! - Per-peer sessions that answer, remember and fetch wants

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod session;

// Re-export main types for convenience
pub use codec::{DecodeError, WantEntry, WantList};
pub use config::WantConfig;
pub use endpoint::{ByteStream, ChannelSink, Endpoint, Method, WantSink, BLOBS_GET};
pub use error::{FetchError, WantError};
pub use manager::{Announcement, SessionId, WantManager};
pub use session::PeerWantSession;
