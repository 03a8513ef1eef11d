#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-event-log-memory** – In-memory event log driver (C1) for the
//! ApplicationAccess sharded event pipeline.
//!
//! This backend keeps every event in a `Vec` guarded by a single lock. It is
//! not durable and exists for read replicas under test and for the target
//! side of splitter/merger unit tests, the way `toka-store-memory`'s
//! `MemoryBackend` exists alongside `toka-store-sqlite`'s durable driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use aam_event_log_core::{deletion_order, DeletionPhase, EventLogStore};
use aam_types::error::AamError;
use aam_types::event::{Event, EventId, EventKind};
use aam_types::shard::HashRange;

struct Inner {
    /// Events in commit order.
    events: Vec<Event>,
    /// `event_id` → position in `events`, for O(1) lookups.
    index: HashMap<EventId, usize>,
}

/// An in-memory, non-durable event log.
///
/// All data is lost when the value is dropped. Reads and the batch append
/// are serialized through a single `parking_lot::RwLock`, matching
/// `toka-store-memory`'s guarded-`HashMap` shape generalized to an ordered
/// sequence.
#[derive(Clone)]
pub struct MemoryEventLog {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    /// Creates a new, empty in-memory event log.
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(Inner { events: Vec::new(), index: HashMap::new() })) }
    }

    /// Number of events currently stored.
    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    /// True iff no events are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn kind_matches_phase(kind: &EventKind, phase: DeletionPhase) -> bool {
    matches!(
        (kind, phase),
        (EventKind::GroupToEntityMapping { .. }, DeletionPhase::GroupToEntityMapping)
            | (EventKind::UserToEntityMapping { .. }, DeletionPhase::UserToEntityMapping)
            | (EventKind::GroupToComponentAccess { .. }, DeletionPhase::GroupToComponentAccess)
            | (EventKind::UserToComponentAccess { .. }, DeletionPhase::UserToComponentAccess)
            | (EventKind::UserToGroupMapping { .. }, DeletionPhase::UserToGroupMapping)
            | (EventKind::Group { .. }, DeletionPhase::GroupPrimary)
            | (EventKind::User { .. }, DeletionPhase::UserPrimary)
    )
}

#[async_trait]
impl EventLogStore for MemoryEventLog {
    async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<Event>, AamError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let commit_time = Utc::now();
        let mut guard = self.inner.write();
        let mut stamped = Vec::with_capacity(events.len());
        for (sequence, event) in events.into_iter().enumerate() {
            let stamped_event = event.with_transaction_coords(commit_time, sequence as u64);
            guard.index.insert(stamped_event.event_id, guard.events.len());
            guard.events.push(stamped_event.clone());
            stamped.push(stamped_event);
        }
        drop(guard);
        Ok(stamped)
    }

    async fn get_initial_event(&self) -> Result<Option<Event>, AamError> {
        Ok(self.inner.read().events.first().cloned())
    }

    async fn get_next_after(&self, event_id: EventId) -> Result<Option<EventId>, AamError> {
        let guard = self.inner.read();
        let idx = *guard.index.get(&event_id).ok_or(AamError::EventNotFound(event_id))?;
        Ok(guard.events.get(idx + 1).map(|e| e.event_id))
    }

    async fn get_events(
        &self,
        start_event_id: EventId,
        hash_range: HashRange,
        include_unfiltered_group_events: bool,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, AamError> {
        if max_count == Some(0) {
            return Ok(Vec::new());
        }
        let guard = self.inner.read();
        let start_idx = *guard.index.get(&start_event_id).ok_or(AamError::EventNotFound(start_event_id))?;
        let limit = max_count.unwrap_or(usize::MAX);
        let matches = guard.events[start_idx..]
            .iter()
            .filter(|event| {
                event.in_range(hash_range) || (!include_unfiltered_group_events && event.kind.is_group_primary())
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn delete_in_range(&self, hash_range: HashRange, include_group_primary: bool) -> Result<(), AamError> {
        let phases = deletion_order(include_group_primary);
        let mut guard = self.inner.write();
        for phase in phases {
            guard
                .events
                .retain(|event| !(kind_matches_phase(&event.kind, phase) && hash_range.contains(event.hash_code)));
        }
        guard.index = guard.events.iter().enumerate().map(|(i, e)| (e.event_id, i)).collect();
        Ok(())
    }

    async fn event_exists(&self, event_id: EventId) -> Result<bool, AamError> {
        Ok(self.inner.read().index.contains_key(&event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::event::Action;
    use uuid::Uuid;

    fn user_event(user: &str) -> Event {
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, Utc::now())
    }

    #[tokio::test]
    async fn append_batch_stamps_distinct_sequences() {
        let log = MemoryEventLog::new();
        let events = vec![user_event("alice"), user_event("bob"), user_event("carol")];
        let stamped = log.append_batch(events).await.unwrap();
        assert_eq!(stamped[0].transaction_sequence, Some(0));
        assert_eq!(stamped[1].transaction_sequence, Some(1));
        assert_eq!(stamped[2].transaction_sequence, Some(2));
        assert_eq!(stamped[0].transaction_time, stamped[2].transaction_time);
    }

    #[tokio::test]
    async fn empty_batch_commits_cleanly() {
        let log = MemoryEventLog::new();
        let stamped = log.append_batch(Vec::new()).await.unwrap();
        assert!(stamped.is_empty());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn get_next_after_walks_the_chain_and_ends_at_tail() {
        let log = MemoryEventLog::new();
        let stamped = log.append_batch(vec![user_event("a"), user_event("b")]).await.unwrap();
        let next = log.get_next_after(stamped[0].event_id).await.unwrap();
        assert_eq!(next, Some(stamped[1].event_id));
        let tail = log.get_next_after(stamped[1].event_id).await.unwrap();
        assert_eq!(tail, None);
    }

    #[tokio::test]
    async fn get_next_after_unknown_id_fails() {
        let log = MemoryEventLog::new();
        let result = log.get_next_after(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AamError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn get_events_max_count_zero_returns_empty() {
        let log = MemoryEventLog::new();
        let stamped = log.append_batch(vec![user_event("a")]).await.unwrap();
        let events = log
            .get_events(stamped[0].event_id, HashRange::FULL, true, Some(0))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn event_exists_reflects_committed_state() {
        let log = MemoryEventLog::new();
        let stamped = log.append_batch(vec![user_event("alice")]).await.unwrap();
        assert!(log.event_exists(stamped[0].event_id).await.unwrap());
        assert!(!log.event_exists(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_in_range_respects_hash_boundaries() {
        let log = MemoryEventLog::new();
        let a = user_event("alice");
        let b = user_event("bob");
        let stamped = log.append_batch(vec![a.clone(), b.clone()]).await.unwrap();
        let alice_hash = stamped[0].hash_code;
        log.delete_in_range(HashRange::new(alice_hash, alice_hash), false).await.unwrap();
        assert_eq!(log.len(), 1);
    }
}
