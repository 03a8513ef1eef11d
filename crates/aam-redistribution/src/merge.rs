//! Shard Group Merger (C8, `spec.md` §4.8).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use aam_event_log_core::EventLogStore;
use aam_persister::{BulkPersister, EventSink, IdempotentBulkPersister};
use aam_router::Router;
use aam_types::error::AamError;
use aam_types::event::{Action, Event, EventKind};
use aam_types::retry::{poll_until, RetryPolicy};
use aam_types::shard::{HashRange, ShardConfiguration, ShardConfigurationSet, ShardDataElement, ShardOperation};

use crate::WriteSideAdministrator;

/// Behavior once one source is permanently exhausted while the other still
/// has buffered or fetchable events (`spec.md` §4.8 step 3b).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoEventsReadAction {
    /// Drain everything remaining from the non-empty source, fetching until
    /// it too is exhausted.
    PersistAllEventsFromOtherSource,
    /// Persist only what is already buffered, then stop without fetching
    /// further batches from the non-empty source.
    StopMerging,
}

/// Parameters for one merge run.
pub struct MergeConfig {
    /// First source shard group's hash range.
    pub source1_range: HashRange,
    /// Second source shard group's hash range, adjacent to the first.
    pub source2_range: HashRange,
    /// The endpoint the combined range should route to once merged.
    pub target_endpoint: String,
    /// The data element both sources hold.
    pub data_element: ShardDataElement,
    /// Number of forwarded events accumulated before a batch is committed
    /// to the target (distinct from the per-source read batch size: each
    /// read still pages via the same count, per `spec.md` §4.8's scenario).
    pub event_batch_size: usize,
    /// Retry budget for polling router quiescence on both sources.
    pub quiescence_retry: RetryPolicy,
    /// Retry budget for each batch commit to the target.
    pub persist_retry: RetryPolicy,
    /// Drain-mode behavior once one source exhausts before the other.
    pub no_events_read_action: NoEventsReadAction,
    /// If true, a detected source-data inconsistency (duplicate filter
    /// "Exception" row) is logged and skipped instead of aborting the
    /// merge with `MergeIntegrityError`.
    pub ignore_invalid_events: bool,
}

/// Outcome of a completed merge.
pub struct MergeOutcome {
    /// Number of batches committed to the target across both interleave
    /// rounds.
    pub batches_persisted: u64,
}

enum FilterDecision {
    Forward,
    Drop,
    Invalid(String),
}

fn primary_key(kind: &EventKind) -> Option<(u8, String)> {
    match kind {
        EventKind::User { user } => Some((kind.tag(), user.clone())),
        EventKind::Group { group } => Some((kind.tag(), group.clone())),
        EventKind::EntityType { entity_type } => Some((kind.tag(), entity_type.clone())),
        EventKind::Entity { entity_type, entity } => Some((kind.tag(), format!("{entity_type}\u{0}{entity}"))),
        _ => None,
    }
}

/// Per-kind, per-source presence tracking implementing the duplicate-event
/// table in `spec.md` §4.8. `EntityType`/`Entity` get the same treatment as
/// `User`/`Group` (`spec.md` §9 open question, resolved: apply the filter
/// uniformly to all four primary kinds rather than requiring callers to
/// pre-deduplicate).
struct DuplicateFilter {
    presence: HashMap<(u8, String), (bool, bool)>,
}

impl DuplicateFilter {
    fn new() -> Self {
        Self { presence: HashMap::new() }
    }

    fn evaluate(&mut self, source_index: u8, event: &Event) -> FilterDecision {
        let Some(key) = primary_key(&event.kind) else {
            // Secondary (mapping) events pass through unfiltered; their
            // correctness follows from each source's own invariants.
            return FilterDecision::Forward;
        };
        let entry = self.presence.entry(key).or_insert((false, false));
        let (in1, in2) = *entry;
        match (event.action, source_index) {
            (Action::Add, 1) => match (in1, in2) {
                (false, false) => {
                    entry.0 = true;
                    FilterDecision::Forward
                }
                (false, true) => FilterDecision::Drop,
                (true, _) => FilterDecision::Invalid(format!("duplicate Add from source 1 for {:?}", event.kind)),
            },
            (Action::Add, 2) => match (in1, in2) {
                (false, false) => {
                    entry.1 = true;
                    FilterDecision::Forward
                }
                (true, false) => FilterDecision::Drop,
                (_, true) => FilterDecision::Invalid(format!("duplicate Add from source 2 for {:?}", event.kind)),
            },
            (Action::Remove, 1) => match (in1, in2) {
                (true, false) => {
                    entry.0 = false;
                    FilterDecision::Forward
                }
                (true, true) => {
                    entry.0 = false;
                    FilterDecision::Drop
                }
                (false, _) => FilterDecision::Invalid(format!("Remove with no prior Add from source 1 for {:?}", event.kind)),
            },
            (Action::Remove, 2) => match (in1, in2) {
                (false, true) => {
                    entry.1 = false;
                    FilterDecision::Forward
                }
                (true, true) => {
                    entry.1 = false;
                    FilterDecision::Drop
                }
                (_, false) => FilterDecision::Invalid(format!("Remove with no prior Add from source 2 for {:?}", event.kind)),
            },
            (_, other) => unreachable!("source_index must be 1 or 2, got {other}"),
        }
    }
}

/// Per-source read cursor: prefetches up to `event_batch_size` events at a
/// time into a FIFO queue (`spec.md` §4.8 steps 1-2).
///
/// Unlike the splitter (which relocates a sub-range out of a larger shard
/// and so must filter reads to that sub-range), the merger relocates an
/// entire source shard group's log, so reads are unfiltered
/// (`HashRange::FULL`) — every event the source holds belongs in the
/// merged target.
struct SourceCursor {
    log: Arc<dyn EventLogStore>,
    last_consumed: Option<aam_types::event::EventId>,
    queue: VecDeque<Event>,
}

impl SourceCursor {
    fn new(log: Arc<dyn EventLogStore>) -> Self {
        Self { log, last_consumed: None, queue: VecDeque::new() }
    }

    /// Re-queries the log from just past the last event this cursor has
    /// consumed (or from the log's start, if it has never consumed one),
    /// rather than latching a terminal state. A second interleave round
    /// started after the merge's quiescence pause (`spec.md` §4.8 step 4)
    /// relies on this to pick up events committed during the pause instead
    /// of seeing a cursor stuck permanently empty.
    async fn fetch_more(&mut self, batch_size: usize) -> Result<(), AamError> {
        if !self.queue.is_empty() {
            return Ok(());
        }
        let start_id = match self.last_consumed {
            Some(last_id) => self.log.get_next_after(last_id).await?,
            None => self.log.get_initial_event().await?.map(|event| event.event_id),
        };
        let Some(start_id) = start_id else { return Ok(()) };
        let batch = self.log.get_events(start_id, HashRange::FULL, true, Some(batch_size)).await?;
        if batch.is_empty() {
            return Ok(());
        }
        self.last_consumed = Some(batch.last().expect("batch checked non-empty above").event_id);
        self.queue.extend(batch);
        Ok(())
    }

    /// Whether this cursor has nothing buffered right now. Not a permanent
    /// state — a later call to [`Self::fetch_more`] may find newly
    /// committed events and un-exhaust it.
    fn exhausted(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Accumulates forwarded events and commits them to the target once
/// `batch_size` is reached, matching the target-side batch granularity
/// described in `spec.md` §4.8's interleave scenario.
struct OutputBatcher<'a> {
    persister: &'a IdempotentBulkPersister,
    batch_size: usize,
    pending: Vec<Event>,
    batches_persisted: u64,
}

impl<'a> OutputBatcher<'a> {
    fn new(persister: &'a IdempotentBulkPersister, batch_size: usize) -> Self {
        Self { persister, batch_size: batch_size.max(1), pending: Vec::new(), batches_persisted: 0 }
    }

    async fn push(&mut self, event: Event) -> Result<(), AamError> {
        self.pending.push(event);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AamError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.persister.persist(batch).await?;
        self.batches_persisted += 1;
        Ok(())
    }
}

async fn apply_filter_and_forward(
    event: Event,
    source_index: u8,
    filter: &mut DuplicateFilter,
    out: &mut OutputBatcher<'_>,
    ignore_invalid_events: bool,
) -> Result<(), AamError> {
    match filter.evaluate(source_index, &event) {
        FilterDecision::Forward => out.push(event).await,
        FilterDecision::Drop => Ok(()),
        FilterDecision::Invalid(reason) => {
            if ignore_invalid_events {
                tracing::warn!(reason = %reason, "ignoring invalid merge event");
                Ok(())
            } else {
                Err(AamError::MergeIntegrityError(reason))
            }
        }
    }
}

async fn drain_source(
    cur: &mut SourceCursor,
    source_index: u8,
    filter: &mut DuplicateFilter,
    batch_size: usize,
    out: &mut OutputBatcher<'_>,
    ignore_invalid_events: bool,
) -> Result<(), AamError> {
    loop {
        while let Some(event) = cur.queue.pop_front() {
            apply_filter_and_forward(event, source_index, filter, out, ignore_invalid_events).await?;
        }
        cur.fetch_more(batch_size).await?;
        if cur.queue.is_empty() {
            return Ok(());
        }
    }
}

fn flush_buffered(cur: &mut SourceCursor) -> Vec<Event> {
    cur.queue.drain(..).collect()
}

/// Runs the interleave loop (`spec.md` §4.8 step 3) until both sources are
/// permanently empty or a drain-mode exit condition is reached.
async fn run_interleave_round(
    cur1: &mut SourceCursor,
    cur2: &mut SourceCursor,
    filter: &mut DuplicateFilter,
    config: &MergeConfig,
    out: &mut OutputBatcher<'_>,
) -> Result<(), AamError> {
    loop {
        cur1.fetch_more(config.event_batch_size).await?;
        cur2.fetch_more(config.event_batch_size).await?;

        let done1 = cur1.exhausted();
        let done2 = cur2.exhausted();

        if done1 && done2 {
            return Ok(());
        }

        if done1 && !done2 {
            match config.no_events_read_action {
                NoEventsReadAction::PersistAllEventsFromOtherSource => {
                    return drain_source(cur2, 2, filter, config.event_batch_size, out, config.ignore_invalid_events).await;
                }
                NoEventsReadAction::StopMerging => {
                    for event in flush_buffered(cur2) {
                        apply_filter_and_forward(event, 2, filter, out, config.ignore_invalid_events).await?;
                    }
                    return Ok(());
                }
            }
        }

        if done2 && !done1 {
            match config.no_events_read_action {
                NoEventsReadAction::PersistAllEventsFromOtherSource => {
                    return drain_source(cur1, 1, filter, config.event_batch_size, out, config.ignore_invalid_events).await;
                }
                NoEventsReadAction::StopMerging => {
                    for event in flush_buffered(cur1) {
                        apply_filter_and_forward(event, 1, filter, out, config.ignore_invalid_events).await?;
                    }
                    return Ok(());
                }
            }
        }

        let pick_source1 = {
            let e1 = cur1.queue.front().expect("not exhausted implies non-empty queue");
            let e2 = cur2.queue.front().expect("not exhausted implies non-empty queue");
            e1.order_key() <= e2.order_key()
        };

        let (event, source_index) =
            if pick_source1 { (cur1.queue.pop_front().unwrap(), 1) } else { (cur2.queue.pop_front().unwrap(), 2) };

        apply_filter_and_forward(event, source_index, filter, out, config.ignore_invalid_events).await?;
    }
}

fn apply_merge_config_switch(
    config: &mut ShardConfigurationSet,
    data_element: ShardDataElement,
    source1_range: HashRange,
    source2_range: HashRange,
    combined_range: HashRange,
    target_endpoint: &str,
) {
    for range in [source1_range, source2_range] {
        if let Some(entry) = config
            .entries()
            .iter()
            .find(|entry| entry.data_element == data_element && entry.operation == ShardOperation::Event && entry.hash_range() == range)
            .cloned()
        {
            config.remove((entry.data_element, entry.operation, entry.hash_range_start));
        }
    }
    config
        .insert(ShardConfiguration {
            data_element,
            operation: ShardOperation::Event,
            hash_range_start: combined_range.start,
            hash_range_end: combined_range.end,
            client_endpoint: target_endpoint.to_string(),
        })
        .expect("combined range does not collide with an existing entry");
}

/// Runs a full merge: bulk interleave, pause-and-drain, config switch.
///
/// On `QuiescenceTimeout`, routing is resumed on both sources and the
/// caller sees the error — no config switch has happened.
pub async fn run_merge(
    source1: Arc<dyn EventLogStore>,
    source2: Arc<dyn EventLogStore>,
    target: Arc<dyn EventLogStore>,
    router: &Router,
    admin1: Option<Arc<dyn WriteSideAdministrator>>,
    admin2: Option<Arc<dyn WriteSideAdministrator>>,
    config: MergeConfig,
) -> Result<MergeOutcome, AamError> {
    let mut cur1 = SourceCursor::new(Arc::clone(&source1));
    let mut cur2 = SourceCursor::new(Arc::clone(&source2));
    let mut filter = DuplicateFilter::new();
    let persister = IdempotentBulkPersister::new(
        BulkPersister::new(EventSink::Primary(Arc::clone(&target)), config.persist_retry, None),
        Arc::clone(&target),
    );
    let mut out = OutputBatcher::new(&persister, config.event_batch_size);

    run_interleave_round(&mut cur1, &mut cur2, &mut filter, &config, &mut out).await?;
    out.flush().await?;

    let combined_range =
        HashRange::new(config.source1_range.start.min(config.source2_range.start), config.source1_range.end.max(config.source2_range.end));

    router.pause_incoming_events(config.source1_range);
    router.pause_incoming_events(config.source2_range);
    if let Err(err) = poll_until(config.quiescence_retry, || async {
        router.get_active_operations_count(config.source1_range) == 0 && router.get_active_operations_count(config.source2_range) == 0
    })
    .await
    {
        router.resume_incoming_events(config.source1_range);
        router.resume_incoming_events(config.source2_range);
        return Err(err);
    }

    if let Some(admin) = &admin1 {
        admin.flush_now().await;
    }
    if let Some(admin) = &admin2 {
        admin.flush_now().await;
    }

    run_interleave_round(&mut cur1, &mut cur2, &mut filter, &config, &mut out).await?;
    out.flush().await?;

    router
        .update_config(|cfg| {
            apply_merge_config_switch(cfg, config.data_element, config.source1_range, config.source2_range, combined_range, &config.target_endpoint)
        })
        .await;
    router.route_range_to(combined_range, config.target_endpoint.clone());
    router.clear_dual_route(combined_range);
    router.resume_incoming_events(config.source1_range);
    router.resume_incoming_events(config.source2_range);

    Ok(MergeOutcome { batches_persisted: out.batches_persisted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_event_log_memory::MemoryEventLog;
    use aam_types::event::{Action, Event, EventKind};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn user_event_at(user: &str, micros: i64) -> Event {
        let occurred = DateTime::from_timestamp_micros(micros).unwrap();
        Event::new(Uuid::new_v4(), EventKind::User { user: user.to_string() }, Action::Add, occurred)
    }

    fn config_for(endpoint1: &str, endpoint2: &str) -> ShardConfigurationSet {
        ShardConfigurationSet::new(vec![
            ShardConfiguration {
                data_element: ShardDataElement::User,
                operation: ShardOperation::Event,
                hash_range_start: 0,
                hash_range_end: 499,
                client_endpoint: endpoint1.to_string(),
            },
            ShardConfiguration {
                data_element: ShardDataElement::User,
                operation: ShardOperation::Event,
                hash_range_start: 500,
                hash_range_end: 999,
                client_endpoint: endpoint2.to_string(),
            },
        ])
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_interleaves_by_transaction_time_and_batches_output() {
        let source1: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let source2: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let target: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());

        // `transaction_time` is stamped from the commit wall clock (not
        // `occurred_time`), so the two sources' commits are interleaved
        // call-by-call to reproduce the A,B,C,D,E,F,G,H pattern (spec.md S4).
        let pairs = [("a", "b"), ("c", "d"), ("e", "f"), ("g", "h")];
        for (micros, (left, right)) in pairs.into_iter().enumerate() {
            let micros = micros as i64;
            source1.append_batch(vec![user_event_at(left, micros * 2)]).await.unwrap();
            source2.append_batch(vec![user_event_at(right, micros * 2 + 1)]).await.unwrap();
        }

        let router = Router::new(config_for("node-1", "node-2"));
        let config = MergeConfig {
            source1_range: HashRange::new(0, 499),
            source2_range: HashRange::new(500, 999),
            target_endpoint: "node-merged".to_string(),
            data_element: ShardDataElement::User,
            event_batch_size: 2,
            quiescence_retry: RetryPolicy::new(5, std::time::Duration::from_millis(1)),
            persist_retry: RetryPolicy::NONE,
            no_events_read_action: NoEventsReadAction::PersistAllEventsFromOtherSource,
            ignore_invalid_events: false,
        };

        let outcome = run_merge(Arc::clone(&source1), Arc::clone(&source2), Arc::clone(&target), &router, None, None, config)
            .await
            .unwrap();

        assert_eq!(outcome.batches_persisted, 4);
        assert_eq!(target.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_add_across_sources_is_dropped_not_persisted_twice() {
        let source1: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let source2: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let target: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());

        source1.append_batch(vec![user_event_at("alice", 1)]).await.unwrap();
        source2.append_batch(vec![user_event_at("alice", 2)]).await.unwrap();

        let router = Router::new(config_for("node-1", "node-2"));
        let config = MergeConfig {
            source1_range: HashRange::new(0, 499),
            source2_range: HashRange::new(500, 999),
            target_endpoint: "node-merged".to_string(),
            data_element: ShardDataElement::User,
            event_batch_size: 10,
            quiescence_retry: RetryPolicy::new(5, std::time::Duration::from_millis(1)),
            persist_retry: RetryPolicy::NONE,
            no_events_read_action: NoEventsReadAction::PersistAllEventsFromOtherSource,
            ignore_invalid_events: false,
        };

        run_merge(source1, source2, Arc::clone(&target), &router, None, None, config).await.unwrap();
        assert_eq!(target.len(), 1);
    }

    #[tokio::test]
    async fn remove_without_prior_add_is_a_merge_integrity_error() {
        let mut filter = DuplicateFilter::new();
        let remove_alice = Event::new(Uuid::new_v4(), EventKind::User { user: "alice".to_string() }, Action::Remove, Utc::now());
        let decision = filter.evaluate(1, &remove_alice);
        assert!(matches!(decision, FilterDecision::Invalid(_)));
    }

    #[tokio::test]
    async fn stop_merging_persists_only_what_is_already_buffered() {
        let source1: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let source2: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let target: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());

        source1.append_batch(vec![user_event_at("alice", 1), user_event_at("bob", 3)]).await.unwrap();

        let router = Router::new(config_for("node-1", "node-2"));
        let config = MergeConfig {
            source1_range: HashRange::new(0, 499),
            source2_range: HashRange::new(500, 999),
            target_endpoint: "node-merged".to_string(),
            data_element: ShardDataElement::User,
            event_batch_size: 10,
            quiescence_retry: RetryPolicy::new(5, std::time::Duration::from_millis(1)),
            persist_retry: RetryPolicy::NONE,
            no_events_read_action: NoEventsReadAction::StopMerging,
            ignore_invalid_events: false,
        };

        run_merge(source1, source2, Arc::clone(&target), &router, None, None, config).await.unwrap();
        assert_eq!(target.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_interleave_round_picks_up_events_committed_after_the_first() {
        let source1: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let source2: Arc<dyn EventLogStore> = Arc::new(MemoryEventLog::new());
        let target = Arc::new(MemoryEventLog::new()) as Arc<dyn EventLogStore>;
        source1.append_batch(vec![user_event_at("alice", 1)]).await.unwrap();

        let mut cur1 = SourceCursor::new(Arc::clone(&source1));
        let mut cur2 = SourceCursor::new(Arc::clone(&source2));
        let mut filter = DuplicateFilter::new();
        let persister = IdempotentBulkPersister::new(
            BulkPersister::new(EventSink::Primary(Arc::clone(&target)), RetryPolicy::NONE, None),
            Arc::clone(&target),
        );
        let config = MergeConfig {
            source1_range: HashRange::new(0, 499),
            source2_range: HashRange::new(500, 999),
            target_endpoint: "node-merged".to_string(),
            data_element: ShardDataElement::User,
            event_batch_size: 10,
            quiescence_retry: RetryPolicy::NONE,
            persist_retry: RetryPolicy::NONE,
            no_events_read_action: NoEventsReadAction::PersistAllEventsFromOtherSource,
            ignore_invalid_events: false,
        };
        let mut out = OutputBatcher::new(&persister, config.event_batch_size);

        // First round: both cursors run dry after draining "alice".
        run_interleave_round(&mut cur1, &mut cur2, &mut filter, &config, &mut out).await.unwrap();
        out.flush().await.unwrap();
        assert_eq!(target.len(), 1);

        // A new event lands on source1 during the pause window, between the
        // first and second interleave rounds (`spec.md` §4.8 step 4).
        source1.append_batch(vec![user_event_at("bob", 5)]).await.unwrap();

        run_interleave_round(&mut cur1, &mut cur2, &mut filter, &config, &mut out).await.unwrap();
        out.flush().await.unwrap();
        assert_eq!(target.len(), 2);
    }
}
