#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-persister** – Bulk persister (C2) for the ApplicationAccess sharded
//! event pipeline.
//!
//! Generalizes the teacher's persister family from class inheritance to
//! composition, per the design note: each persister is a thin struct over
//! an [`EventSink`] capability (`Primary | File | Redundant`) rather than a
//! subclass, the way `toka-store-core`'s `WalStorageBackend` adds a
//! capability over `StorageBackend` by wrapping rather than inheriting.

mod backup_file;

pub use backup_file::BackupEventFile;

use std::sync::Arc;

use tracing::warn;

use aam_event_log_core::EventLogStore;
use aam_replay_cache::ReplayCache;
use aam_types::error::AamError;
use aam_types::event::{Event, EventId};
use aam_types::retry::{with_retry, RetryPolicy};

/// The underlying commit capability a persister writes through.
///
/// Composition replacement for the teacher's persister class hierarchy
/// (`spec.md` §9): a persister holds one of these rather than subclassing a
/// base persister.
pub enum EventSink {
    /// Commits straight to a durable event log.
    Primary(Arc<dyn EventLogStore>),
    /// Writes only to the local backup file — no durable commit authority.
    /// Used when a process runs detached from its primary store (e.g. an
    /// edge buffer that forwards its backup file out-of-band).
    File(BackupEventFile),
    /// Commits to a durable event log, falling back to the backup file on
    /// failure and replaying pending backup records on the next success.
    Redundant {
        /// The durable store.
        primary: Arc<dyn EventLogStore>,
        /// The local fallback journal.
        backup: BackupEventFile,
    },
}

fn stamp_batch(events: Vec<Event>, commit_time: chrono::DateTime<chrono::Utc>) -> Vec<Event> {
    events
        .into_iter()
        .enumerate()
        .map(|(sequence, event)| event.with_transaction_coords(commit_time, sequence as u64))
        .collect()
}

impl EventSink {
    async fn append(&self, events: Vec<Event>, policy: RetryPolicy) -> Result<Vec<Event>, AamError> {
        match self {
            EventSink::Primary(store) => {
                with_retry(policy, || {
                    let store = Arc::clone(store);
                    let events = events.clone();
                    async move { store.append_batch(events).await }
                })
                .await
            }
            EventSink::File(backup) => {
                let stamped = stamp_batch(events, chrono::Utc::now());
                backup.append(&stamped).await?;
                Ok(stamped)
            }
            EventSink::Redundant { primary, backup } => {
                let commit_attempt = with_retry(policy, || {
                    let primary = Arc::clone(primary);
                    let events = events.clone();
                    async move { primary.append_batch(events).await }
                })
                .await;

                match commit_attempt {
                    Ok(stamped) => {
                        let pending = backup.read_all().await?;
                        if !pending.is_empty() {
                            primary.append_batch(pending).await?;
                            backup.truncate().await?;
                        }
                        Ok(stamped)
                    }
                    Err(err) => {
                        warn!(error = %err, "primary commit failed, routing batch to backup file");
                        backup.append(&events).await?;
                        Ok(Vec::new())
                    }
                }
            }
        }
    }
}

/// Commits a buffered batch through an [`EventSink`], then mirrors the
/// stamped result into a [`ReplayCache`] (C3), matching the
/// C2 → C1/C3 data flow in `spec.md` §2.
pub struct BulkPersister {
    sink: EventSink,
    retry_policy: RetryPolicy,
    replay_cache: Option<Arc<ReplayCache>>,
}

impl BulkPersister {
    /// Builds a persister over `sink`, retrying transient failures per
    /// `retry_policy`. `replay_cache`, if given, receives every
    /// successfully committed batch.
    pub fn new(sink: EventSink, retry_policy: RetryPolicy, replay_cache: Option<Arc<ReplayCache>>) -> Self {
        Self { sink, retry_policy, replay_cache }
    }

    /// Commits `events` as a single batch. An empty batch commits cleanly
    /// without touching the sink.
    pub async fn persist(&self, events: Vec<Event>) -> Result<Vec<Event>, AamError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let stamped = self.sink.append(events, self.retry_policy).await?;
        if let Some(cache) = &self.replay_cache {
            cache.insert_batch(stamped.clone());
        }
        Ok(stamped)
    }
}

/// Wraps a [`BulkPersister`] and silently skips events whose `event_id`
/// already exists at the sink's primary store, giving redistribution (C7/C8)
/// an at-least-once-safe resubmission path (`spec.md` §4.2/§8).
///
/// Only meaningful over an [`EventSink::Primary`] or [`EventSink::Redundant`]
/// sink — both expose a durable store to check existence against.
pub struct IdempotentBulkPersister {
    inner: BulkPersister,
    store: Arc<dyn EventLogStore>,
}

impl IdempotentBulkPersister {
    /// Builds an idempotent persister over `inner`, checking prior
    /// existence against `store` (the same store `inner`'s sink commits
    /// to).
    pub fn new(inner: BulkPersister, store: Arc<dyn EventLogStore>) -> Self {
        Self { inner, store }
    }

    /// Commits only the events in `events` not already present at `store`,
    /// in their original relative order.
    pub async fn persist(&self, events: Vec<Event>) -> Result<Vec<Event>, AamError> {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if !self.store.event_exists(event.event_id).await? {
                fresh.push(event);
            }
        }
        self.inner.persist(fresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_event_log_memory::MemoryEventLog;
    use aam_types::event::{Action, EventKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn user_event(user: &str) -> Event {
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, Utc::now())
    }

    #[tokio::test]
    async fn persist_commits_and_feeds_replay_cache() {
        let store: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let cache = Arc::new(ReplayCache::new(10));
        let persister = BulkPersister::new(EventSink::Primary(Arc::clone(&store)), RetryPolicy::NONE, Some(Arc::clone(&cache)));

        let stamped = persister.persist(vec![user_event("alice")]).await.unwrap();
        assert_eq!(stamped.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_commits_cleanly() {
        let store: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let persister = BulkPersister::new(EventSink::Primary(store), RetryPolicy::NONE, None);
        let stamped = persister.persist(Vec::new()).await.unwrap();
        assert!(stamped.is_empty());
    }

    #[tokio::test]
    async fn idempotent_persister_skips_existing_event_ids() {
        let store: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let inner = BulkPersister::new(EventSink::Primary(Arc::clone(&store)), RetryPolicy::NONE, None);
        let idempotent = IdempotentBulkPersister::new(inner, Arc::clone(&store));

        let event = user_event("alice");
        let first = idempotent.persist(vec![event.clone()]).await.unwrap();
        assert_eq!(first.len(), 1);

        // Re-submitting the already-committed event_id is a no-op.
        let second = idempotent.persist(vec![first[0].clone()]).await.unwrap();
        assert!(second.is_empty());

        let count = store.get_events(first[0].event_id, aam_types::shard::HashRange::FULL, true, None).await.unwrap();
        assert_eq!(count.len(), 1);
    }

    #[tokio::test]
    async fn redundant_sink_falls_back_to_backup_file_on_primary_failure() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl EventLogStore for AlwaysFails {
            async fn append_batch(&self, _events: Vec<Event>) -> Result<Vec<Event>, AamError> {
                Err(AamError::StorageFault("primary unreachable".into()))
            }
            async fn get_initial_event(&self) -> Result<Option<Event>, AamError> {
                Ok(None)
            }
            async fn get_next_after(&self, event_id: EventId) -> Result<Option<EventId>, AamError> {
                Err(AamError::EventNotFound(event_id))
            }
            async fn get_events(
                &self,
                start_event_id: EventId,
                _hash_range: aam_types::shard::HashRange,
                _include_unfiltered_group_events: bool,
                _max_count: Option<usize>,
            ) -> Result<Vec<Event>, AamError> {
                Err(AamError::EventNotFound(start_event_id))
            }
            async fn delete_in_range(
                &self,
                _hash_range: aam_types::shard::HashRange,
                _include_group_primary: bool,
            ) -> Result<(), AamError> {
                Ok(())
            }
            async fn event_exists(&self, _event_id: EventId) -> Result<bool, AamError> {
                Ok(false)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let backup = BackupEventFile::new(dir.path().join("backup.log"));
        let primary: Arc<dyn EventLogStore> = Arc::new(AlwaysFails);
        let persister = BulkPersister::new(
            EventSink::Redundant { primary, backup: backup.clone() },
            RetryPolicy::NONE,
            None,
        );

        let stamped = persister.persist(vec![user_event("alice")]).await.unwrap();
        assert!(stamped.is_empty());
        let pending = backup.read_all().await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
