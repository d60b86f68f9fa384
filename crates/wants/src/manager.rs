//! Local want set
//!
//! A want lives until the store reports a put of the wanted blob. There is
//! no explicit unwant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use blobs_core::{BlobRef, BlobStore, Cancel, ChangeNotifier, StoreOp};
use parking_lot::Mutex;
use tracing::{debug, info_span, trace, Span};

use crate::codec::{WantEntry, WantList};
use crate::config::WantConfig;
use crate::endpoint::{Endpoint, WantSink};
use crate::error::WantError;
use crate::session::PeerWantSession;

/// Identifies one peer session of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A newly recorded want
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub entry: WantEntry,
    /// Session whose peer request was relayed into this want; that session
    /// does not send it back
    pub relayed_by: Option<SessionId>,
}

/// Tracks which blobs this node wants and fans new wants out to peer sessions
pub struct WantManager {
    store: Arc<BlobStore>,
    config: WantConfig,
    wants: Arc<Mutex<AHashMap<BlobRef, i64>>>,
    announcements: ChangeNotifier<Announcement>,
    next_session: AtomicU64,
    store_sub: Cancel,
}

impl WantManager {
    pub fn new(store: Arc<BlobStore>, config: WantConfig) -> Arc<Self> {
        let wants: Arc<Mutex<AHashMap<BlobRef, i64>>> = Arc::default();

        let tracked = wants.clone();
        let store_sub = store.changes().register(move |event| {
            if event.op != StoreOp::Put {
                return;
            }
            if tracked.lock().remove(&event.blob).is_some() {
                debug!(blob = %event.blob, "want satisfied");
            }
        });

        Arc::new(Self {
            store,
            config,
            wants,
            announcements: ChangeNotifier::new(),
            next_session: AtomicU64::new(0),
            store_sub,
        })
    }

    /// Want a blob directly (hop count 1)
    pub fn want(&self, blob: &BlobRef) -> Result<(), WantError> {
        self.want_with_dist(blob, -1)
    }

    /// Record a want at `distance` and announce it to every session
    ///
    /// Returns without recording anything when the blob is already stored.
    ///
    /// `distance` must be negative (a request at hop count `-distance`);
    /// non-negative values are sizes, which only peers advertise, and are
    /// rejected with [`WantError::InvalidDistance`].
    pub fn want_with_dist(&self, blob: &BlobRef, distance: i64) -> Result<(), WantError> {
        self.record(blob, distance, None)
    }

    /// Record a want relayed from the peer of session `from`, announcing it
    /// to every other session
    pub(crate) fn relay(
        &self,
        blob: &BlobRef,
        distance: i64,
        from: SessionId,
    ) -> Result<(), WantError> {
        self.record(blob, distance, Some(from))
    }

    fn record(
        &self,
        blob: &BlobRef,
        distance: i64,
        relayed_by: Option<SessionId>,
    ) -> Result<(), WantError> {
        if distance >= 0 {
            return Err(WantError::InvalidDistance(distance));
        }

        match self.store.get(blob) {
            Ok(file) => {
                drop(file);
                trace!(%blob, "want already satisfied");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!(%blob, error = %e, "store lookup failed, recording want anyway"),
        }

        let mut wants = self.wants.lock();
        wants.insert(blob.clone(), distance);

        // a put that landed after the lookup above has already fired its event
        if matches!(self.store.has(blob), Ok(true)) {
            wants.remove(blob);
            return Ok(());
        }

        debug!(%blob, distance, "wanting blob");
        self.announcements.emit(&Announcement {
            entry: WantEntry::new(blob.clone(), distance),
            relayed_by,
        });
        Ok(())
    }

    pub fn wants(&self, blob: &BlobRef) -> bool {
        self.wants.lock().contains_key(blob)
    }

    /// Snapshot of the local want set
    pub fn wanted(&self) -> WantList {
        self.wants
            .lock()
            .iter()
            .map(|(blob, distance)| (blob.clone(), *distance))
            .collect()
    }

    /// Feed of wants as they are recorded
    pub fn announcements(&self) -> &ChangeNotifier<Announcement> {
        &self.announcements
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub fn config(&self) -> &WantConfig {
        &self.config
    }

    /// Attach a session to a peer connection
    ///
    /// The current want set is sent to the peer before this returns. Must
    /// be called from within a tokio runtime.
    pub fn create_wants(
        self: &Arc<Self>,
        endpoint: Arc<dyn Endpoint>,
        sink: Arc<dyn WantSink>,
    ) -> Result<PeerWantSession, WantError> {
        self.create_wants_in(endpoint, sink, info_span!("want_session"))
    }

    /// Like [`create_wants`](Self::create_wants), logging under `span`
    pub fn create_wants_in(
        self: &Arc<Self>,
        endpoint: Arc<dyn Endpoint>,
        sink: Arc<dyn WantSink>,
        span: Span,
    ) -> Result<PeerWantSession, WantError> {
        PeerWantSession::start(self.clone(), endpoint, sink, span)
    }

    /// Hand the current want set to `first`, then subscribe `on_want` to
    /// later wants, with no want recorded in between.
    pub(crate) fn attach<F>(
        &self,
        first: impl FnOnce(WantList) -> anyhow::Result<()>,
        on_want: F,
    ) -> Result<Cancel, WantError>
    where
        F: Fn(&Announcement) + Send + Sync + 'static,
    {
        let wants = self.wants.lock();
        let snapshot = wants
            .iter()
            .map(|(blob, distance)| (blob.clone(), *distance))
            .collect();
        first(snapshot).map_err(WantError::Sink)?;
        Ok(self.announcements.register(on_want))
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for WantManager {
    fn drop(&mut self) {
        self.store_sub.cancel();
    }
}
