#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-router** – Operation router (C6) for the ApplicationAccess sharded
//! event pipeline.
//!
//! Computes the key-element hash for each request and resolves the target
//! shard-group endpoint from a versioned [`ShardConfigurationSet`] snapshot,
//! plus independent pause/hold switches per hash range used by redistribution
//! (C7/C8) to reach quiescence. Grounded on `toka-kernel::Kernel`'s
//! `Arc<RwLock<_>>`-guarded state and dispatch shape, generalized from
//! single-state mutation to routing-table lookup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock as AsyncRwLock;

use aam_types::error::AamError;
use aam_types::hash::hash32;
use aam_types::shard::{HashRange, ShardConfigurationSet, ShardDataElement, ShardOperation};

/// The resolved destination for a routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// The shard-group endpoint to dispatch to.
    pub endpoint: String,
    /// The key element's hash, computed once and reused by the caller
    /// (e.g. to stamp the outgoing event's `hash_code`).
    pub hash_code: i32,
}

/// Decrements the owning hash range's active-operation count when dropped.
/// Only requests that resolved to [`RouteOutcome::Dispatch`] hold one —
/// held/queued requests are not "actively executing" (`spec.md` §9 open
/// question: the original polls until zero, implying only downstream
/// execution counts, not queued requests).
pub struct ActiveOperationGuard {
    active_ops: Arc<DashMap<u64, i32>>,
    op_id: u64,
}

impl Drop for ActiveOperationGuard {
    fn drop(&mut self) {
        self.active_ops.remove(&self.op_id);
    }
}

/// The result of routing one request.
pub enum RouteOutcome {
    /// Dispatch immediately to the attached target. The guard must be kept
    /// alive for the duration of the downstream call so
    /// `get_active_operations_count` reflects it.
    Dispatch(RouteTarget, ActiveOperationGuard),
    /// The hash range is held: enqueue the request but do not dispatch it
    /// (`spec.md` §4.6).
    Held,
}

/// Routes requests to shard-group endpoints and coordinates pause/hold
/// state for online redistribution (C7/C8).
pub struct Router {
    config: AsyncRwLock<ShardConfigurationSet>,
    version: AtomicU64,
    paused_ranges: SyncRwLock<HashSet<HashRange>>,
    held_ranges: SyncRwLock<HashSet<HashRange>>,
    dual_routes: SyncRwLock<Vec<(HashRange, String)>>,
    active_ops: Arc<DashMap<u64, i32>>,
    next_op_id: AtomicU64,
}

impl Router {
    /// Builds a router over an initial shard configuration.
    pub fn new(config: ShardConfigurationSet) -> Self {
        Self {
            config: AsyncRwLock::new(config),
            version: AtomicU64::new(0),
            paused_ranges: SyncRwLock::new(HashSet::new()),
            held_ranges: SyncRwLock::new(HashSet::new()),
            dual_routes: SyncRwLock::new(Vec::new()),
            active_ops: Arc::new(DashMap::new()),
            next_op_id: AtomicU64::new(0),
        }
    }

    /// Routes a request keyed by `key_element`. Event-operation requests
    /// are subject to pause/hold; query-operation requests are not
    /// (`spec.md` §4.6: pause/hold name "incoming events" specifically).
    pub async fn route(
        &self,
        data_element: ShardDataElement,
        operation: ShardOperation,
        key_element: &str,
    ) -> Result<RouteOutcome, AamError> {
        let hash_code = hash32(key_element);

        if operation == ShardOperation::Event {
            if let Some(range) = Self::matching_range(&self.paused_ranges, hash_code) {
                return Err(AamError::RoutingPaused(range.start, range.end));
            }
            if Self::matching_range(&self.held_ranges, hash_code).is_some() {
                return Ok(RouteOutcome::Held);
            }
        }

        let endpoint = self.resolve_endpoint(data_element, operation, hash_code).await?;
        let guard = self.begin_operation(hash_code);
        Ok(RouteOutcome::Dispatch(RouteTarget { endpoint, hash_code }, guard))
    }

    fn matching_range(set: &SyncRwLock<HashSet<HashRange>>, hash_code: i32) -> Option<HashRange> {
        set.read().iter().find(|range| range.contains(hash_code)).copied()
    }

    async fn resolve_endpoint(
        &self,
        data_element: ShardDataElement,
        operation: ShardOperation,
        hash_code: i32,
    ) -> Result<String, AamError> {
        if let Some((_, endpoint)) =
            self.dual_routes.read().iter().find(|(range, _)| range.contains(hash_code))
        {
            return Ok(endpoint.clone());
        }
        let config = self.config.read().await;
        let entry = config
            .lookup(data_element, operation, hash_code)
            .ok_or_else(|| AamError::ValidationError(format!("no shard configuration owns hash {hash_code}")))?;
        Ok(entry.client_endpoint.clone())
    }

    fn begin_operation(&self, hash_code: i32) -> ActiveOperationGuard {
        let op_id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        self.active_ops.insert(op_id, hash_code);
        ActiveOperationGuard { active_ops: Arc::clone(&self.active_ops), op_id }
    }

    /// Pauses incoming event requests whose key hash lies in `range`;
    /// subsequent calls to [`Self::route`] for that range fail with
    /// [`AamError::RoutingPaused`] until [`Self::resume_incoming_events`].
    pub fn pause_incoming_events(&self, range: HashRange) {
        self.paused_ranges.write().insert(range);
    }

    /// Resumes routing previously paused by [`Self::pause_incoming_events`].
    pub fn resume_incoming_events(&self, range: HashRange) {
        self.paused_ranges.write().remove(&range);
    }

    /// Holds incoming event requests in `range`: routed as
    /// [`RouteOutcome::Held`] rather than dispatched or rejected.
    pub fn hold_events(&self, range: HashRange) {
        self.held_ranges.write().insert(range);
    }

    /// Releases a hold previously set by [`Self::hold_events`].
    pub fn release_events(&self, range: HashRange) {
        self.held_ranges.write().remove(&range);
    }

    /// The number of requests currently dispatched (not merely held/queued)
    /// whose key hash lies in `range`.
    pub fn get_active_operations_count(&self, range: HashRange) -> usize {
        self.active_ops.iter().filter(|entry| range.contains(*entry.value())).count()
    }

    /// Redirects `source_range` to `target_endpoint` without a full config
    /// reload, for dual routing during a split/merge migration
    /// (`spec.md` §4.6). Replaces any existing override for the same range.
    pub fn route_range_to(&self, source_range: HashRange, target_endpoint: impl Into<String>) {
        let mut dual = self.dual_routes.write();
        dual.retain(|(range, _)| *range != source_range);
        dual.push((source_range, target_endpoint.into()));
    }

    /// Removes a dual-routing override, once the config switch step has
    /// made it redundant.
    pub fn clear_dual_route(&self, source_range: HashRange) {
        self.dual_routes.write().retain(|(range, _)| *range != source_range);
    }

    /// Applies `mutate` to the shard configuration set under the writer
    /// lock, bumping the version counter so readers observe a consistent
    /// snapshot (`spec.md` §5).
    pub async fn update_config(&self, mutate: impl FnOnce(&mut ShardConfigurationSet)) {
        let mut config = self.config.write().await;
        mutate(&mut config);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// A clone of the current shard configuration set.
    pub async fn config_snapshot(&self) -> ShardConfigurationSet {
        self.config.read().await.clone()
    }

    /// Monotonically increasing version, bumped on every [`Self::update_config`].
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::shard::ShardConfiguration;

    fn config_with_entry(start: i32, end: i32, endpoint: &str) -> ShardConfigurationSet {
        ShardConfigurationSet::new(vec![ShardConfiguration {
            data_element: ShardDataElement::User,
            operation: ShardOperation::Event,
            hash_range_start: start,
            hash_range_end: end,
            client_endpoint: endpoint.to_string(),
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn routes_to_configured_endpoint() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        let outcome = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await.unwrap();
        match outcome {
            RouteOutcome::Dispatch(target, _guard) => assert_eq!(target.endpoint, "node-a"),
            RouteOutcome::Held => panic!("expected dispatch"),
        }
    }

    #[tokio::test]
    async fn pause_rejects_event_routing_in_range() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        router.pause_incoming_events(HashRange::FULL);
        let result = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await;
        assert!(matches!(result, Err(AamError::RoutingPaused(_, _))));
    }

    #[tokio::test]
    async fn hold_returns_held_without_counting_as_active() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        router.hold_events(HashRange::FULL);
        let outcome = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Held));
        assert_eq!(router.get_active_operations_count(HashRange::FULL), 0);
    }

    #[tokio::test]
    async fn active_operation_count_tracks_guard_lifetime() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        let outcome = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await.unwrap();
        let RouteOutcome::Dispatch(_target, guard) = outcome else { panic!("expected dispatch") };
        assert_eq!(router.get_active_operations_count(HashRange::FULL), 1);
        drop(guard);
        assert_eq!(router.get_active_operations_count(HashRange::FULL), 0);
    }

    #[tokio::test]
    async fn dual_route_overrides_config_lookup() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        router.route_range_to(HashRange::FULL, "node-b");
        let outcome = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await.unwrap();
        match outcome {
            RouteOutcome::Dispatch(target, _guard) => assert_eq!(target.endpoint, "node-b"),
            RouteOutcome::Held => panic!("expected dispatch"),
        }
    }

    #[tokio::test]
    async fn query_routing_ignores_pause() {
        let mut entries = config_with_entry(i32::MIN, i32::MAX, "node-a").entries().to_vec();
        entries.push(ShardConfiguration {
            data_element: ShardDataElement::User,
            operation: ShardOperation::Query,
            hash_range_start: i32::MIN,
            hash_range_end: i32::MAX,
            client_endpoint: "node-a-reader".to_string(),
        });
        let router = Router::new(ShardConfigurationSet::new(entries).unwrap());
        router.pause_incoming_events(HashRange::FULL);
        let outcome = router.route(ShardDataElement::User, ShardOperation::Query, "alice").await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Dispatch(_, _)));
    }

    #[tokio::test]
    async fn update_config_bumps_version() {
        let router = Router::new(config_with_entry(i32::MIN, i32::MAX, "node-a"));
        assert_eq!(router.version(), 0);
        router
            .update_config(|config| {
                config.replace(
                    (ShardDataElement::User, ShardOperation::Event, i32::MIN),
                    ShardConfiguration {
                        data_element: ShardDataElement::User,
                        operation: ShardOperation::Event,
                        hash_range_start: i32::MIN,
                        hash_range_end: i32::MAX,
                        client_endpoint: "node-b".to_string(),
                    },
                )
            })
            .await;
        assert_eq!(router.version(), 1);
        let outcome = router.route(ShardDataElement::User, ShardOperation::Event, "alice").await.unwrap();
        match outcome {
            RouteOutcome::Dispatch(target, _guard) => assert_eq!(target.endpoint, "node-b"),
            RouteOutcome::Held => panic!("expected dispatch"),
        }
    }
}
