//! Shard Group Splitter (C7, `spec.md` §4.7).

use std::sync::Arc;

use aam_event_log_core::EventLogStore;
use aam_persister::{BulkPersister, EventSink, IdempotentBulkPersister};
use aam_router::Router;
use aam_types::error::AamError;
use aam_types::retry::{poll_until, RetryPolicy};
use aam_types::shard::{HashRange, ShardConfiguration, ShardConfigurationSet, ShardDataElement, ShardOperation};

use crate::WriteSideAdministrator;

/// Parameters for one split run.
pub struct SplitConfig {
    /// The sub-range to relocate from source to target.
    pub split_range: HashRange,
    /// The endpoint the split range should route to once the migration
    /// completes.
    pub target_endpoint: String,
    /// The data element the source/target shard groups hold.
    pub data_element: ShardDataElement,
    /// Max events copied per batch during the bulk and drain phases.
    pub event_batch_size: usize,
    /// True iff the source is a group shard group, controlling both the
    /// `include_unfiltered_group_events` flag passed to `get_events` and the
    /// `include_group_primary` flag passed to `delete_in_range`
    /// (`spec.md` §4.7 step 3a / step 5 — both keyed the same way).
    pub source_is_group_shard: bool,
    /// Retry budget for polling router quiescence.
    pub quiescence_retry: RetryPolicy,
    /// Retry budget for each batch commit to the target.
    pub persist_retry: RetryPolicy,
}

async fn copy_range_to_target(
    source: &Arc<dyn EventLogStore>,
    target: &Arc<dyn EventLogStore>,
    config: &SplitConfig,
) -> Result<(), AamError> {
    let persister = IdempotentBulkPersister::new(
        BulkPersister::new(EventSink::Primary(Arc::clone(target)), config.persist_retry, None),
        Arc::clone(target),
    );

    let mut current = source.get_initial_event().await?.map(|event| event.event_id);
    while let Some(start_id) = current {
        let batch = source
            .get_events(start_id, config.split_range, config.source_is_group_shard, Some(config.event_batch_size))
            .await?;
        if batch.is_empty() {
            break;
        }
        persister.persist(batch.clone()).await?;
        let last_id = batch.last().expect("batch checked non-empty above").event_id;
        current = source.get_next_after(last_id).await?;
    }
    Ok(())
}

/// Removes `cut` from `original`, returning the 0-2 residual ranges that
/// remain. `cut` need not touch either boundary of `original`.
fn subtract_range(original: HashRange, cut: HashRange) -> Vec<HashRange> {
    let mut residual = Vec::new();
    if original.start < cut.start {
        residual.push(HashRange::new(original.start, cut.start - 1));
    }
    if cut.end < original.end {
        residual.push(HashRange::new(cut.end + 1, original.end));
    }
    residual
}

fn apply_split_config_switch(
    config: &mut ShardConfigurationSet,
    data_element: ShardDataElement,
    split_range: HashRange,
    target_endpoint: &str,
) {
    let affected: Vec<ShardConfiguration> = config
        .entries()
        .iter()
        .filter(|entry| {
            entry.data_element == data_element
                && entry.operation == ShardOperation::Event
                && entry.hash_range().contains_range(split_range)
        })
        .cloned()
        .collect();

    for entry in affected {
        config.remove((entry.data_element, entry.operation, entry.hash_range_start));
        for residual in subtract_range(entry.hash_range(), split_range) {
            config
                .insert(ShardConfiguration {
                    data_element: entry.data_element,
                    operation: entry.operation,
                    hash_range_start: residual.start,
                    hash_range_end: residual.end,
                    client_endpoint: entry.client_endpoint.clone(),
                })
                .expect("residual range does not collide with an existing entry");
        }
    }

    config
        .insert(ShardConfiguration {
            data_element,
            operation: ShardOperation::Event,
            hash_range_start: split_range.start,
            hash_range_end: split_range.end,
            client_endpoint: target_endpoint.to_string(),
        })
        .expect("target entry does not collide with an existing entry");
}

/// Runs a full split: bulk copy, pause-and-drain, config switch, cleanup.
///
/// On `QuiescenceTimeout`, routing is resumed and the source is left
/// untouched — the caller sees the error and no config switch has happened
/// (`spec.md` §5 "Cancellation and timeouts").
pub async fn run_split(
    source: Arc<dyn EventLogStore>,
    target: Arc<dyn EventLogStore>,
    router: &Router,
    admin: Option<Arc<dyn WriteSideAdministrator>>,
    config: SplitConfig,
) -> Result<(), AamError> {
    copy_range_to_target(&source, &target, &config).await?;

    router.pause_incoming_events(config.split_range);
    if let Err(err) = poll_until(config.quiescence_retry, || async {
        router.get_active_operations_count(config.split_range) == 0
    })
    .await
    {
        router.resume_incoming_events(config.split_range);
        return Err(err);
    }

    if let Some(admin) = &admin {
        admin.flush_now().await;
    }
    copy_range_to_target(&source, &target, &config).await?;

    router
        .update_config(|cfg| apply_split_config_switch(cfg, config.data_element, config.split_range, &config.target_endpoint))
        .await;
    router.route_range_to(config.split_range, config.target_endpoint.clone());
    router.clear_dual_route(config.split_range);
    router.resume_incoming_events(config.split_range);

    source.delete_in_range(config.split_range, config.source_is_group_shard).await?;
    Ok(())
}
