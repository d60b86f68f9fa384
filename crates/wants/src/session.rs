//! Per-peer want exchange
//!
//! A session answers the peer's requests from the local store, remembers
//! the ones it could not answer and replies as soon as the store reports
//! the blob. Advertisements for blobs this node wants start a background
//! fetch over the peer's `blobs.get` stream.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use blobs_core::{BlobRef, BlobStore, Cancel, StoreOp};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::codec::WantList;
use crate::endpoint::{Endpoint, WantSink, BLOBS_GET};
use crate::error::{FetchError, WantError};
use crate::manager::{Announcement, SessionId, WantManager};

struct Shared {
    manager: Arc<WantManager>,
    endpoint: Arc<dyn Endpoint>,
    sink: Arc<dyn WantSink>,
    remote_wants: Mutex<AHashMap<BlobRef, i64>>,
    fetches: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
    span: Span,
}

/// Want exchange with one connected peer
///
/// Closing (or dropping) the session stops all reactions to store and
/// want events. Fetches already started keep running until they finish.
pub struct PeerWantSession {
    id: SessionId,
    shared: Arc<Shared>,
    store_sub: Cancel,
    want_sub: Cancel,
    closed: AtomicBool,
}

impl PeerWantSession {
    pub(crate) fn start(
        manager: Arc<WantManager>,
        endpoint: Arc<dyn Endpoint>,
        sink: Arc<dyn WantSink>,
        span: Span,
    ) -> Result<Self, WantError> {
        let runtime = Handle::try_current().map_err(|_| WantError::NoRuntime)?;
        let id = manager.next_session_id();
        let shared = Arc::new(Shared {
            manager: manager.clone(),
            endpoint,
            sink: sink.clone(),
            remote_wants: Mutex::default(),
            fetches: Mutex::default(),
            runtime,
            span: span.clone(),
        });

        let on_store = shared.clone();
        let store_sub = manager.store().changes().register(move |event| {
            if event.op == StoreOp::Put {
                on_store.satisfy(&event.blob);
            }
        });

        let want_span = span.clone();
        let want_sink = sink.clone();
        let want_sub = manager.attach(
            |initial| {
                let _enter = span.enter();
                debug!(wants = initial.len(), "sending initial want list");
                sink.send(initial)
            },
            move |announced: &Announcement| {
                if announced.relayed_by == Some(id) {
                    return;
                }
                let _enter = want_span.enter();
                let entry = &announced.entry;
                let wants = WantList::single(entry.blob.clone(), entry.distance);
                if let Err(e) = want_sink.send(wants) {
                    debug!(blob = %entry.blob, error = %e, "dropping want announcement");
                }
            },
        );
        let want_sub = match want_sub {
            Ok(sub) => sub,
            Err(e) => {
                store_sub.cancel();
                return Err(e);
            }
        };

        span.in_scope(|| info!(%id, "want session started"));
        Ok(Self {
            id,
            shared,
            store_sub,
            want_sub,
            closed: AtomicBool::new(false),
        })
    }

    /// Process one decoded want message from the peer
    ///
    /// Available requested blobs are answered in a single reply. Fetch
    /// failures are logged by the fetch task and never reported here.
    pub fn handle(&self, wants: WantList) -> Result<(), WantError> {
        if self.is_closed() {
            return Err(WantError::Closed);
        }
        let shared = &self.shared;
        let _enter = shared.span.enter();
        let store = shared.manager.store();
        let config = shared.manager.config();

        let mut reply = WantList::new();
        let mut relay = Vec::new();
        for (blob, distance) in wants {
            if distance >= 0 {
                if shared.manager.wants(&blob) {
                    self.spawn_fetch(blob);
                } else {
                    debug!(%blob, size = distance, "ignoring unwanted advertisement");
                }
                continue;
            }

            let mut remote = shared.remote_wants.lock();
            match store.size(&blob) {
                Ok(size) => {
                    remote.remove(&blob);
                    reply.insert(blob, advertised_size(size));
                }
                Err(e) if e.is_not_found() => {
                    let forwarded = distance.saturating_sub(1);
                    debug!(%blob, distance = forwarded, "peer wants missing blob");
                    remote.insert(blob.clone(), forwarded);
                    if config.should_relay(forwarded) && !shared.manager.wants(&blob) {
                        relay.push((blob, forwarded));
                    }
                }
                Err(e) => warn!(%blob, error = %e, "cannot answer want"),
            }
        }

        for (blob, distance) in relay {
            debug!(%blob, distance, "relaying want");
            if let Err(e) = shared.manager.relay(&blob, distance, self.id) {
                warn!(%blob, error = %e, "failed to relay want");
            }
        }
        if !reply.is_empty() {
            debug!(entries = reply.len(), "answering wants");
            shared.sink.send(reply).map_err(WantError::Sink)?;
        }
        Ok(())
    }

    /// Decode a raw want message and process it
    pub fn handle_raw(&self, input: &[u8]) -> Result<(), WantError> {
        let wants = WantList::decode(input)?;
        self.handle(wants)
    }

    /// Blobs the peer asked for that are not stored yet, with their
    /// forwarded distance
    pub fn remote_wants(&self) -> WantList {
        self.shared
            .remote_wants
            .lock()
            .iter()
            .map(|(blob, distance)| (blob.clone(), *distance))
            .collect()
    }

    /// Wait for every fetch started so far, including ones started while waiting
    pub async fn wait_fetches(&self) {
        loop {
            let pending = mem::take(&mut *self.shared.fetches.lock());
            if pending.is_empty() {
                return;
            }
            for result in join_all(pending).await {
                if let Err(e) = result {
                    warn!(parent: &self.shared.span, error = %e, "fetch task panicked");
                }
            }
        }
    }

    /// Stop reacting to events and close the outbound sink. Idempotent.
    pub fn close(&self) -> Result<(), WantError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store_sub.cancel();
        self.want_sub.cancel();
        info!(parent: &self.shared.span, "want session closed");
        self.shared.sink.close().map_err(WantError::Sink)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn spawn_fetch(&self, blob: BlobRef) {
        let shared = &self.shared;
        let endpoint = shared.endpoint.clone();
        let store = shared.manager.store().clone();
        let limit = shared.manager.config().max_fetch_size;
        let span = info_span!(parent: &shared.span, "fetch", %blob);

        let task = shared.runtime.spawn(
            async move {
                match fetch(endpoint.as_ref(), store, &blob, limit).await {
                    Ok(size) => debug!(size, "fetched blob"),
                    Err(e) => warn!(error = %e, "fetch failed"),
                }
            }
            .instrument(span),
        );

        let mut fetches = shared.fetches.lock();
        fetches.retain(|t| !t.is_finished());
        fetches.push(task);
    }
}

impl Shared {
    /// Reply to a pending peer request for a blob that just landed
    fn satisfy(&self, blob: &BlobRef) {
        let _enter = self.span.enter();
        let mut remote = self.remote_wants.lock();
        if !remote.contains_key(blob) {
            return;
        }
        match self.manager.store().size(blob) {
            Ok(size) => {
                remote.remove(blob);
                debug!(%blob, size, "answering pending want");
                let reply = WantList::single(blob.clone(), advertised_size(size));
                if let Err(e) = self.sink.send(reply) {
                    warn!(%blob, error = %e, "failed to send want reply");
                }
            }
            Err(e) => warn!(%blob, error = %e, "stored blob is not readable"),
        }
    }
}

impl Drop for PeerWantSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(parent: &self.shared.span, error = %e, "error closing want session");
        }
    }
}

fn advertised_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Stream `blob` from the peer, verify it and commit it to `store`
///
/// Returns the number of bytes stored.
pub(crate) async fn fetch(
    endpoint: &dyn Endpoint,
    store: Arc<BlobStore>,
    blob: &BlobRef,
    limit: u64,
) -> Result<u64, FetchError> {
    let stream = endpoint
        .source(BLOBS_GET, blob)
        .await
        .map_err(FetchError::Rpc)?;

    let mut content = Vec::new();
    stream
        .take(limit.saturating_add(1))
        .read_to_end(&mut content)
        .await?;
    let size = content.len() as u64;
    if size > limit {
        return Err(FetchError::TooLarge { limit });
    }

    let actual = BlobRef::digest(&content);
    if actual != *blob {
        return Err(FetchError::IntegrityMismatch {
            expected: blob.clone(),
            actual,
        });
    }

    tokio::task::spawn_blocking(move || store.put(content.as_slice())).await??;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WantConfig;
    use crate::endpoint::{ByteStream, ChannelSink, Method};
    use async_trait::async_trait;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Serves fixed bytes per reference, whatever they hash to
    #[derive(Default)]
    struct FixedEndpoint {
        blobs: Mutex<AHashMap<BlobRef, Vec<u8>>>,
    }

    impl FixedEndpoint {
        fn serve(&self, blob: BlobRef, content: &[u8]) {
            self.blobs.lock().insert(blob, content.to_vec());
        }
    }

    #[async_trait]
    impl Endpoint for FixedEndpoint {
        async fn source(&self, method: Method, blob: &BlobRef) -> anyhow::Result<ByteStream> {
            anyhow::ensure!(method == BLOBS_GET, "unknown method {method}");
            let content = self
                .blobs
                .lock()
                .get(blob)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such blob"))?;
            Ok(Box::pin(Cursor::new(content)))
        }
    }

    /// Accepts the initial want set, then fails every send
    #[derive(Default)]
    struct BrokenAfterFirst {
        used: AtomicBool,
    }

    impl WantSink for BrokenAfterFirst {
        fn send(&self, _wants: WantList) -> anyhow::Result<()> {
            anyhow::ensure!(!self.used.swap(true, Ordering::SeqCst), "peer gone");
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Node {
        dir: TempDir,
        store: Arc<BlobStore>,
        manager: Arc<WantManager>,
        endpoint: Arc<FixedEndpoint>,
    }

    fn node(config: WantConfig) -> Node {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(BlobStore::open(dir.path()).unwrap());
        let manager = WantManager::new(store.clone(), config);
        Node {
            dir,
            store,
            manager,
            endpoint: Arc::default(),
        }
    }

    fn connect(node: &Node) -> (PeerWantSession, UnboundedReceiver<WantList>) {
        let (sink, rx) = ChannelSink::new();
        let session = node
            .manager
            .create_wants(node.endpoint.clone(), Arc::new(sink))
            .unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_initial_message_is_want_set() {
        let node = node(WantConfig::default());
        let blob = BlobRef::digest(b"wanted");
        node.manager.want(&blob).unwrap();

        let (_session, mut rx) = connect(&node);
        assert_eq!(rx.try_recv().unwrap(), WantList::single(blob, -1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initial_message_sent_when_empty() {
        let node = node(WantConfig::default());
        let (_session, mut rx) = connect(&node);
        assert_eq!(rx.try_recv().unwrap(), WantList::new());
    }

    #[tokio::test]
    async fn test_request_for_stored_blob_answered_with_size() {
        let node = node(WantConfig::default());
        let blob = node.store.put(&b"hello world"[..]).unwrap();
        let (session, mut rx) = connect(&node);
        rx.try_recv().unwrap();

        session.handle(WantList::single(blob.clone(), -1)).unwrap();

        assert_eq!(rx.try_recv().unwrap(), WantList::single(blob, 11));
        assert!(session.remote_wants().is_empty());
    }

    #[tokio::test]
    async fn test_request_for_missing_blob_answered_on_put() {
        let node = node(WantConfig::default());
        let (session, mut rx) = connect(&node);
        rx.try_recv().unwrap();

        let blob = BlobRef::digest(b"arrives later");
        session.handle(WantList::single(blob.clone(), -1)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(session.remote_wants().get(&blob), Some(-2));

        node.store.put(&b"arrives later"[..]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WantList::single(blob.clone(), 13));
        assert!(session.remote_wants().is_empty());

        // a second put of the same content does not answer again
        node.store.put(&b"arrives later"[..]).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_event_leaves_remote_wants() {
        let node = node(WantConfig::default());
        let (session, mut rx) = connect(&node);
        rx.try_recv().unwrap();

        let blob = BlobRef::digest(b"comes and goes");
        session.handle(WantList::single(blob.clone(), -1)).unwrap();

        // written behind this store's back, so only the removal is observed
        let side = BlobStore::open(node.dir.path()).unwrap();
        side.put(&b"comes and goes"[..]).unwrap();
        node.store.delete(&blob).unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(session.remote_wants(), WantList::single(blob, -2));
    }

    #[tokio::test]
    async fn test_replies_aggregated_per_message() {
        let node = node(WantConfig::default());
        let a = node.store.put(&b"a"[..]).unwrap();
        let b = node.store.put(&b"bb"[..]).unwrap();
        let missing = BlobRef::digest(b"missing");
        let (session, mut rx) = connect(&node);
        rx.try_recv().unwrap();

        let wants: WantList = [(a.clone(), -1), (b.clone(), -4), (missing.clone(), -1)]
            .into_iter()
            .collect();
        session.handle(wants).unwrap();

        let expected: WantList = [(a, 1), (b, 2)].into_iter().collect();
        assert_eq!(rx.try_recv().unwrap(), expected);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.remote_wants(), WantList::single(missing, -2));
    }

    #[tokio::test]
    async fn test_advertisement_fetches_wanted_blob() {
        let node = node(WantConfig::default());
        let content = b"fetched over the wire";
        let blob = BlobRef::digest(content);
        node.endpoint.serve(blob.clone(), content);
        node.manager.want(&blob).unwrap();
        let (session, _rx) = connect(&node);

        session
            .handle(WantList::single(blob.clone(), content.len() as i64))
            .unwrap();
        session.wait_fetches().await;

        assert!(node.store.has(&blob).unwrap());
        assert!(!node.manager.wants(&blob));
    }

    #[tokio::test]
    async fn test_advertisement_with_bad_content_is_discarded() {
        let node = node(WantConfig::default());
        let blob = BlobRef::digest(b"the real thing");
        node.endpoint.serve(blob.clone(), b"an impostor");
        node.manager.want(&blob).unwrap();
        let (session, _rx) = connect(&node);

        session.handle(WantList::single(blob.clone(), 14)).unwrap();
        session.wait_fetches().await;

        assert!(!node.store.has(&blob).unwrap());
        assert!(!node.store.has(&BlobRef::digest(b"an impostor")).unwrap());
        assert!(node.manager.wants(&blob));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_unwanted_advertisement_ignored() {
        let node = node(WantConfig::default());
        let content = b"nobody asked";
        let blob = BlobRef::digest(content);
        node.endpoint.serve(blob.clone(), content);
        let (session, _rx) = connect(&node);

        session.handle(WantList::single(blob.clone(), 12)).unwrap();
        session.wait_fetches().await;
        assert!(!node.store.has(&blob).unwrap());
    }

    #[tokio::test]
    async fn test_fetch_over_limit_rejected() {
        let node = node(WantConfig {
            max_fetch_size: 4,
            ..WantConfig::default()
        });
        let blob = BlobRef::digest(b"too big");
        node.endpoint.serve(blob.clone(), b"too big");

        let err = fetch(node.endpoint.as_ref(), node.store.clone(), &blob, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 4 }));
        assert!(!node.store.has(&blob).unwrap());
    }

    #[tokio::test]
    async fn test_fetch_reports_mismatch() {
        let node = node(WantConfig::default());
        let blob = BlobRef::digest(b"expected");
        node.endpoint.serve(blob.clone(), b"unexpected");

        let err = fetch(node.endpoint.as_ref(), node.store.clone(), &blob, 1024)
            .await
            .unwrap_err();
        match err {
            FetchError::IntegrityMismatch { expected, actual } => {
                assert_eq!(expected, blob);
                assert_eq!(actual, BlobRef::digest(b"unexpected"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_local_wants_forwarded_to_peer() {
        let node = node(WantConfig::default());
        let (_session, mut rx) = connect(&node);
        rx.try_recv().unwrap();

        let blob = BlobRef::digest(b"later want");
        node.manager.want(&blob).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WantList::single(blob, -1));
    }

    #[tokio::test]
    async fn test_relay_within_hop_limit() {
        let node = node(WantConfig {
            relay_hops: 2,
            ..WantConfig::default()
        });
        let (session, mut rx) = connect(&node);
        let (_other, mut other_rx) = connect(&node);
        rx.try_recv().unwrap();
        other_rx.try_recv().unwrap();

        let near = BlobRef::digest(b"near");
        let far = BlobRef::digest(b"far");
        session.handle(WantList::single(near.clone(), -1)).unwrap();
        session.handle(WantList::single(far.clone(), -2)).unwrap();

        assert_eq!(node.manager.wanted(), WantList::single(near.clone(), -2));
        // the requesting peer is not asked for what it asked for
        assert!(rx.try_recv().is_err());
        assert_eq!(other_rx.try_recv().unwrap(), WantList::single(near, -2));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_survives_failed_reply() {
        let node = node(WantConfig {
            relay_hops: 2,
            ..WantConfig::default()
        });
        let stored = node.store.put(&b"stored"[..]).unwrap();
        let sink = Arc::new(BrokenAfterFirst::default());
        let session = node
            .manager
            .create_wants(node.endpoint.clone(), sink)
            .unwrap();

        let missing = BlobRef::digest(b"missing");
        let wants: WantList = [(stored, -1), (missing.clone(), -1)].into_iter().collect();

        assert!(matches!(session.handle(wants), Err(WantError::Sink(_))));
        assert_eq!(node.manager.wanted(), WantList::single(missing, -2));
    }

    #[tokio::test]
    async fn test_no_relay_by_default() {
        let node = node(WantConfig::default());
        let (session, _rx) = connect(&node);

        session
            .handle(WantList::single(BlobRef::digest(b"x"), -1))
            .unwrap();
        assert!(node.manager.wanted().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unsubscribes() {
        let node = node(WantConfig::default());
        let (session, mut rx) = connect(&node);
        rx.try_recv().unwrap();
        assert_eq!(node.store.changes().subscriber_count(), 2);

        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(node.store.changes().subscriber_count(), 1);
        assert!(matches!(
            session.handle(WantList::new()),
            Err(WantError::Closed)
        ));

        node.manager.want(&BlobRef::digest(b"after close")).unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_handle_raw_rejects_malformed_message() {
        let node = node(WantConfig::default());
        let (session, _rx) = connect(&node);

        assert!(matches!(
            session.handle_raw(b"{} trailing"),
            Err(WantError::Decode(_))
        ));
        session.handle_raw(b"{}").unwrap();
    }

    #[test]
    fn test_session_requires_runtime() {
        let node = node(WantConfig::default());
        let (sink, _rx) = ChannelSink::new();
        let result = node
            .manager
            .create_wants(node.endpoint.clone(), Arc::new(sink));
        assert!(matches!(result, Err(WantError::NoRuntime)));
    }
}
