//! In-process fan-out of store events
//!
//! Delivery is synchronous: `emit` returns only after every registered
//! subscriber has seen the event, and events reach each subscriber in the
//! order `emit` was called.
//!
//! A subscriber must not emit on the notifier that is calling it (for the
//! store's feed: no `put`/`delete` on the same store from inside the
//! callback). The delivery lock is held for the whole emission and is not
//! re-entrant. Registering and cancelling use a separate lock, so both are
//! allowed from inside a callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::hash::BlobRef;

/// Kind of store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Blob committed to its final path
    Put,
    /// Blob file removed
    Remove,
}

/// Store event delivered to subscribers of [`crate::BlobStore::changes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub op: StoreOp,
    pub blob: BlobRef,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: self.active.clone(),
            callback: self.callback.clone(),
        }
    }
}

struct Inner<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    delivery: Mutex<()>,
    next_id: AtomicU64,
}

/// Broadcasts events of type `E` to every registered subscriber
pub struct ChangeNotifier<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ChangeNotifier<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for ChangeNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ChangeNotifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E> ChangeNotifier<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                delivery: Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber; the returned handle unregisters it
    pub fn register<F>(&self, callback: F) -> Cancel
    where
        F: Fn(&E) + Send + Sync + 'static,
        E: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.subscribers.write().push(Subscriber {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        });

        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        Cancel {
            active,
            remove: Mutex::new(Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.write().retain(|s| s.id != id);
                }
            }))),
        }
    }

    /// Deliver `event` to every active subscriber, in registration order
    pub fn emit(&self, event: &E) {
        let _delivery = self.inner.delivery.lock();
        self.deliver(event);
    }

    /// Run `mutate` and, if it succeeds, deliver `event`, all under the
    /// delivery lock
    ///
    /// Two mutations made this way reach subscribers in the order they
    /// took effect.
    pub fn emit_after<T, X>(
        &self,
        event: &E,
        mutate: impl FnOnce() -> std::result::Result<T, X>,
    ) -> std::result::Result<T, X> {
        let _delivery = self.inner.delivery.lock();
        let out = mutate()?;
        self.deliver(event);
        Ok(out)
    }

    fn deliver(&self, event: &E) {
        let subscribers = self.inner.subscribers.read().clone();
        for sub in subscribers {
            if sub.active.load(Ordering::Acquire) {
                (sub.callback)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// Handle returned by [`ChangeNotifier::register`]
///
/// Dropping it does not unregister; call [`Cancel::cancel`].
#[must_use = "dropping a Cancel leaves the subscriber registered"]
pub struct Cancel {
    active: Arc<AtomicBool>,
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Cancel {
    /// Unregister the subscriber. Idempotent.
    ///
    /// Once this returns no new delivery to the subscriber starts; a
    /// delivery already running on another thread finishes normally.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(remove) = self.remove.lock().take() {
            remove();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
