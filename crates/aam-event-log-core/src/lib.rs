#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-event-log-core** – Core event log abstraction (C1) for the
//! ApplicationAccess sharded event pipeline.
//!
//! This crate provides the fundamental storage trait used throughout the
//! pipeline. It sits at the core layer and defines the durable, totally
//! ordered, hash-range-filterable append log contract (`spec.md` §4.1)
//! without providing a concrete implementation.
//!
//! Storage drivers (in-memory, SQL, …) implement [`EventLogStore`] in
//! separate crates that depend on this core abstraction, the way
//! `toka-store-memory`/`toka-store-sqlite` implement `toka-store-core`'s
//! `StorageBackend` trait.

use async_trait::async_trait;

use aam_types::error::AamError;
use aam_types::event::{Event, EventId};
use aam_types::shard::HashRange;

/// Abstraction over a durable, totally-ordered, hash-range-filterable event
/// log (C1, `spec.md` §4.1).
///
/// Implementations must uphold invariants 1–3 from `spec.md` §3: unique
/// event ids, a strictly monotonically non-decreasing
/// `(transaction_time, transaction_sequence)` order, and the referential
/// ordering of secondary events after their primary `Add`.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Atomically commits `events` as a single batch. On success every event
    /// is stamped with a transaction time equal to the batch commit instant
    /// and distinct sequence numbers `0..events.len()`, in the order given.
    /// An empty batch commits cleanly without touching storage.
    async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<Event>, AamError>;

    /// The earliest committed event by `(transaction_time, transaction_sequence)`,
    /// or `None` if the log is empty.
    async fn get_initial_event(&self) -> Result<Option<Event>, AamError>;

    /// The event id immediately following `event_id` in commit order, or
    /// `None` if `event_id` is the tail. Fails with
    /// [`AamError::EventNotFound`] if `event_id` is unknown to the log.
    async fn get_next_after(&self, event_id: EventId) -> Result<Option<EventId>, AamError>;

    /// The ordered sequence of events beginning at `start_event_id`
    /// (inclusive), filtered to `hash_range`, with two standing exceptions
    /// always emitted regardless of hash: `EntityType` and `Entity` events.
    ///
    /// When `include_unfiltered_group_events` is `false`, `Group` primary
    /// events are *also* emitted regardless of hash, so that user-shard
    /// readers see every group referenced by a user→group mapping even
    /// though `Group` is not the user shard's native kind. Group shards
    /// (which hold `Group` as their native, hash-filtered kind) pass `true`.
    ///
    /// Returns at most `max_count` events, or all matching events if `None`.
    /// `max_count = Some(0)` returns empty without touching storage.
    async fn get_events(
        &self,
        start_event_id: EventId,
        hash_range: HashRange,
        include_unfiltered_group_events: bool,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, AamError>;

    /// Permanently removes every event whose `hash_code` lies in
    /// `hash_range`, in the fixed order required to keep foreign references
    /// ahead of their targets: group-to-entity, user-to-entity,
    /// group-to-component-access, user-to-component-access, user-to-group,
    /// then (iff `include_group_primary`) group primary, then user primary.
    /// See [`deletion_order`].
    async fn delete_in_range(&self, hash_range: HashRange, include_group_primary: bool) -> Result<(), AamError>;

    /// True iff `event_id` has already been committed. Backs the idempotent
    /// persister (C2) so redistribution (C7/C8) can resume a crashed bulk
    /// phase by re-submitting a batch without risking duplicate commits.
    async fn event_exists(&self, event_id: EventId) -> Result<bool, AamError>;
}

/// A deletion-phase tag, used by [`deletion_order`] to enumerate the fixed
/// order `delete_in_range` implementations must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPhase {
    /// `GroupToEntityMapping` events.
    GroupToEntityMapping,
    /// `UserToEntityMapping` events.
    UserToEntityMapping,
    /// `GroupToComponentAccess` events.
    GroupToComponentAccess,
    /// `UserToComponentAccess` events.
    UserToComponentAccess,
    /// `UserToGroupMapping` events.
    UserToGroupMapping,
    /// `Group` primary events — only included when the source is a group shard.
    GroupPrimary,
    /// `User` primary events.
    UserPrimary,
}

/// The fixed deletion order from `spec.md` §4.1, centralized here so every
/// backend implementation deletes in the same sequence rather than each
/// re-deriving it. `include_group_primary` controls whether
/// [`DeletionPhase::GroupPrimary`] is present.
pub fn deletion_order(include_group_primary: bool) -> Vec<DeletionPhase> {
    let mut order = vec![
        DeletionPhase::GroupToEntityMapping,
        DeletionPhase::UserToEntityMapping,
        DeletionPhase::GroupToComponentAccess,
        DeletionPhase::UserToComponentAccess,
        DeletionPhase::UserToGroupMapping,
    ];
    if include_group_primary {
        order.push(DeletionPhase::GroupPrimary);
    }
    order.push(DeletionPhase::UserPrimary);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_order_without_group_primary() {
        let order = deletion_order(false);
        assert_eq!(order.last(), Some(&DeletionPhase::UserPrimary));
        assert!(!order.contains(&DeletionPhase::GroupPrimary));
    }

    #[test]
    fn deletion_order_with_group_primary_precedes_user_primary() {
        let order = deletion_order(true);
        let group_idx = order.iter().position(|p| *p == DeletionPhase::GroupPrimary).unwrap();
        let user_idx = order.iter().position(|p| *p == DeletionPhase::UserPrimary).unwrap();
        assert!(group_idx < user_idx);
    }
}
