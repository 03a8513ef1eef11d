#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-replay-cache** – Bounded replay cache (C3) for the ApplicationAccess
//! sharded event pipeline.
//!
//! Serves `events_since(event_id)` to read replicas out of a bounded,
//! in-memory suffix of the committed event stream, without round-tripping to
//! C1 for the common case. Grounded on `toka-bus-core::InMemoryBus`'s
//! broadcast-and-subscribe shape for the live-feed half, generalized with a
//! guarded FIFO + index for the lookup half (the way
//! `toka-store-memory::MemoryBackend` guards its map).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use aam_types::error::AamError;
use aam_types::event::{Event, EventId};

/// Default broadcast channel size for the live-feed subscription.
const DEFAULT_BUFFER: usize = 1024;

struct Inner {
    /// The most recent events, oldest first, capped at `capacity`.
    events: VecDeque<Event>,
    /// `event_id` → position in `events`. Rebuilt on each eviction since
    /// positions shift; kept because `capacity` is typically small relative
    /// to total flush volume.
    index: HashMap<EventId, usize>,
    capacity: usize,
}

impl Inner {
    fn reindex(&mut self) {
        self.index.clear();
        self.index.extend(self.events.iter().enumerate().map(|(i, e)| (e.event_id, i)));
    }

    fn insert(&mut self, event: Event) {
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.reindex();
    }
}

/// A bounded FIFO of at most *N* recently committed events (`spec.md` §4.3),
/// with a stable `event_id` → position index for `events_since` lookups.
///
/// Reads and inserts are serialized through one `parking_lot::RwLock`
/// (brief critical sections, per §5); `events_since` is atomic with respect
/// to concurrent inserts.
pub struct ReplayCache {
    inner: Arc<RwLock<Inner>>,
    broadcast_tx: broadcast::Sender<Event>,
}

impl ReplayCache {
    /// Creates a new cache holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BUFFER.max(capacity));
        Self {
            inner: Arc::new(RwLock::new(Inner {
                events: VecDeque::with_capacity(capacity),
                index: HashMap::new(),
                capacity,
            })),
            broadcast_tx,
        }
    }

    /// Inserts a freshly committed batch, in order, evicting from the head
    /// as needed to stay within capacity. Also rebroadcasts each event to
    /// live subscribers.
    pub fn insert_batch(&self, events: impl IntoIterator<Item = Event>) {
        let mut guard = self.inner.write();
        for event in events {
            guard.insert(event.clone());
            let _ = self.broadcast_tx.send(event);
        }
    }

    /// The events strictly after `event_id`, in insertion order.
    /// Fails with [`AamError::EventNotCached`] if `event_id` is not present
    /// (the caller must fall back to C1).
    pub fn events_since(&self, event_id: EventId) -> Result<Vec<Event>, AamError> {
        let guard = self.inner.read();
        let idx = *guard.index.get(&event_id).ok_or(AamError::EventNotCached(event_id))?;
        Ok(guard.events.iter().skip(idx + 1).cloned().collect())
    }

    /// Subscribes to the live commit stream, for readers that want to avoid
    /// polling `events_since` entirely.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Number of events currently held (≤ capacity).
    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    /// True iff the cache holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::event::{Action, EventKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn user_event(user: &str) -> Event {
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, Utc::now())
    }

    #[test]
    fn events_since_returns_suffix_in_order() {
        let cache = ReplayCache::new(10);
        let e1 = user_event("e1");
        let e2 = user_event("e2");
        let e3 = user_event("e3");
        cache.insert_batch(vec![e1.clone(), e2.clone(), e3.clone()]);

        assert_eq!(cache.events_since(e1.event_id).unwrap(), vec![e2.clone(), e3.clone()]);
        assert_eq!(cache.events_since(e2.event_id).unwrap(), vec![e3.clone()]);
        assert_eq!(cache.events_since(e3.event_id).unwrap(), vec![]);
    }

    #[test]
    fn unknown_event_id_fails_not_cached() {
        let cache = ReplayCache::new(10);
        cache.insert_batch(vec![user_event("e1")]);
        let unknown = Uuid::new_v4();
        assert!(matches!(cache.events_since(unknown), Err(AamError::EventNotCached(_))));
    }

    #[test]
    fn eviction_keeps_at_most_capacity_and_drops_evicted_lookups() {
        let cache = ReplayCache::new(2);
        let e1 = user_event("e1");
        let e2 = user_event("e2");
        let e3 = user_event("e3");
        cache.insert_batch(vec![e1.clone(), e2.clone(), e3.clone()]);

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.events_since(e1.event_id), Err(AamError::EventNotCached(_))));
        assert_eq!(cache.events_since(e2.event_id).unwrap(), vec![e3]);
    }

    #[tokio::test]
    async fn subscribe_receives_inserted_events() {
        let cache = ReplayCache::new(10);
        let mut rx = cache.subscribe();
        let e1 = user_event("e1");
        cache.insert_batch(vec![e1.clone()]);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_id, e1.event_id);
    }
}
