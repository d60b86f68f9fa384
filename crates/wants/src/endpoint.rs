//! Interfaces to the peer connection a want session runs over
//!
//! The transport itself lives outside this crate. A session needs two
//! things from it: a way to open a streamed `blobs.get` call against the
//! peer, and a sink for outbound want messages.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use blobs_core::BlobRef;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::codec::WantList;

/// Byte stream returned by a streamed remote call
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Name of a remote procedure, e.g. `blobs.get`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Method(&'static [&'static str]);

impl Method {
    pub const fn new(parts: &'static [&'static str]) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &'static [&'static str] {
        self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Streams the content of one blob from the peer
pub const BLOBS_GET: Method = Method::new(&["blobs", "get"]);

/// Outbound calls to the connected peer
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Open a streamed call taking a blob reference argument
    async fn source(&self, method: Method, blob: &BlobRef) -> anyhow::Result<ByteStream>;
}

/// Outbound want messages to the connected peer
///
/// `send` is called from store and want notifications, so it must not block.
pub trait WantSink: Send + Sync {
    fn send(&self, wants: WantList) -> anyhow::Result<()>;

    fn close(&self) -> anyhow::Result<()>;
}

/// [`WantSink`] over an unbounded tokio channel; the transport drains the receiver
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<WantList>>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WantList>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl WantSink for ChannelSink {
    fn send(&self, wants: WantList) -> anyhow::Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(wants)
                .map_err(|_| anyhow::anyhow!("peer connection is gone")),
            None => anyhow::bail!("want sink is closed"),
        }
    }

    /// Drops the sender so the receiver ends once drained
    fn close(&self) -> anyhow::Result<()> {
        self.tx.lock().take();
        Ok(())
    }
}
