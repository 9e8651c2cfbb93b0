use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::HeaderMap;
use tap_http::{CallType, Protocol};
use tokio::sync::mpsc;

/// Default per-subscriber buffer capacity used by the daemon.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// An immutable record minted when a proxied (or replayed) call completes.
///
/// Bodies hold the captured prefix after payload extraction, never more than
/// [`tap_http::MAX_CAPTURE_SIZE`] bytes; header maps keep their multi-valued
/// wire shape.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub method: String,
    pub call_type: CallType,
    pub protocol: Protocol,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub status: i32,
    pub error: String,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub request_body: Bytes,
    pub response_body: Bytes,
}

struct BusInner {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Non-blocking single-producer / many-consumer broadcast of [`Event`]s.
///
/// `publish` fans out under the subscriber-map read lock with `try_send`:
/// a subscriber whose buffer is full loses that event, other subscribers and
/// the publisher are unaffected. Subscribing and unsubscribing take the
/// write lock.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a subscriber and returns its ordered receive endpoint
    /// together with an idempotent unsubscribe handle. Dropping the handle
    /// unsubscribes as well.
    pub fn subscribe(&self) -> (mpsc::Receiver<Event>, Subscription) {
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .expect("lock poisoned")
            .insert(id, sender);
        (
            receiver,
            Subscription {
                id,
                inner: Arc::clone(&self.inner),
            },
        )
    }

    /// Delivers `event` to every current subscriber without blocking.
    pub fn publish(&self, event: &Event) {
        let subscribers = self.inner.subscribers.read().expect("lock poisoned");
        for sender in subscribers.values() {
            // Full buffer: drop for this subscriber only.
            let _ = sender.try_send(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("lock poisoned")
            .len()
    }
}

/// Unsubscribe capability for one bus subscription.
pub struct Subscription {
    id: u64,
    inner: Arc<BusInner>,
}

impl Subscription {
    /// Removes the subscription, closing its channel once drained. Calling
    /// this more than once is a no-op.
    pub fn unsubscribe(&self) {
        self.inner
            .subscribers
            .write()
            .expect("lock poisoned")
            .remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
