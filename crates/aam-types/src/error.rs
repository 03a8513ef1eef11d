//! Shared error taxonomy (`spec.md` §7).
//!
//! One flat enum rather than one type per crate: downstream crates convert
//! their I/O-specific failures (`sqlx::Error`, `std::io::Error`, …) into this
//! shared type at the boundary, the way `toka-store-raft::RaftStorageError`
//! wraps `anyhow::Error`/`bincode::Error` instead of re-deriving overlapping
//! variants crate by crate.

use crate::event::EventId;

/// Errors surfaced across the event pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AamError {
    /// A storage call failed in a way its retry policy classifies as
    /// transient (connection reset, deadlock, timeout). Callers should not
    /// see this variant directly — it is consumed by the retry combinator
    /// in [`crate::retry`] and escalated to [`AamError::StorageFault`] after
    /// the retry budget is exhausted.
    #[error("transient storage error: {0}")]
    TransientStorageError(String),

    /// A storage call failed non-transiently, or a transient error exhausted
    /// its retry budget. No partial batch is left committed.
    #[error("storage fault: {0}")]
    StorageFault(String),

    /// A write-buffer or router input failed validation; no state changed.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// `get_next_after` was called with an `event_id` unknown to the log.
    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// `events_since` was called with an `event_id` outside the replay
    /// cache's bounded window; the caller must fall back to C1.
    #[error("event not cached: {0}")]
    EventNotCached(EventId),

    /// The operation router has paused event routing for the requested hash
    /// range; the caller should retry after resume.
    #[error("routing paused for range [{0}, {1}]")]
    RoutingPaused(i32, i32),

    /// A split/merge could not reach quiescence (zero active operations in
    /// the paused range) within the configured retry budget. The migration
    /// is aborted; no configuration switch has been performed.
    #[error("quiescence not reached after {attempts} attempts")]
    QuiescenceTimeout {
        /// Number of polling attempts made before giving up.
        attempts: u32,
    },

    /// The merge duplicate filter observed a primary-element event sequence
    /// inconsistent with either source's local invariants (`spec.md` §4.8
    /// table, "Exception" rows).
    #[error("merge integrity error: {0}")]
    MergeIntegrityError(String),

    /// A `ShardConfigurationSet` was constructed with two entries sharing a
    /// `(data_element, operation, hash_range_start)` key.
    #[error("duplicate shard configuration for {data_element}/{operation:?} starting at {hash_range_start}")]
    DuplicateShardConfiguration {
        /// The data element of the colliding entries.
        data_element: String,
        /// The operation of the colliding entries.
        operation: String,
        /// The shared `hash_range_start` of the colliding entries.
        hash_range_start: i32,
    },
}

impl AamError {
    /// True for errors a caller should retry without escalating — mirrors
    /// `RaftStorageError::is_retryable` in the teacher's raft storage
    /// driver, adapted to this crate's flatter taxonomy.
    pub fn is_transient(&self) -> bool {
        matches!(self, AamError::TransientStorageError(_))
    }
}
