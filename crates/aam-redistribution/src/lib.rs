#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-redistribution** – Shard group splitter (C7) and merger (C8).
//!
//! Relocates a hash sub-range between shard groups online: a bulk copy phase
//! while the source keeps accepting writes, then a short pause phase that
//! waits for [`aam_router::Router`] quiescence before switching the shard
//! configuration. Grounded on `toka-store-raft`'s snapshot-then-catch-up
//! replication shape (bulk copy followed by a bounded quiescent cutover),
//! generalized here to hash-range granularity instead of whole-log.

mod merge;
mod split;

pub use merge::{run_merge, MergeConfig, MergeOutcome, NoEventsReadAction};
pub use split::{run_split, SplitConfig};

use async_trait::async_trait;

/// The interface the splitter/merger use to force a source node's in-memory
/// write buffer (C5) to flush to its event log (C1) before the final drain
/// pass (`spec.md` §4.7 step 4c / §4.8 step 4).
#[async_trait]
pub trait WriteSideAdministrator: Send + Sync {
    /// Forces an immediate flush of the pending write buffer.
    async fn flush_now(&self);
}
