//! Wires C1–C6 together into one running process from a [`NodeConfig`].
//!
//! Grounded on `toka-runtime::Runtime::new`'s single-entry-point assembly
//! of its bus/storage/kernel collaborators, generalized here to the event
//! pipeline's own collaborator set (event log, replay cache, write buffer,
//! flush strategy, router).

use std::sync::Arc;

use tracing::info;

use aam_event_log_core::EventLogStore;
use aam_event_log_memory::MemoryEventLog;
use aam_event_log_sql::SqlEventLog;
use aam_flush::FlushStrategy;
use aam_persister::{BulkPersister, EventSink};
use aam_redistribution::WriteSideAdministrator;
use aam_replay_cache::ReplayCache;
use aam_router::Router;
use aam_write_buffer::WriteBuffer;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::flush_admin::FlushStrategyAdministrator;

async fn connect_event_log(database_url: &str) -> Result<Arc<dyn EventLogStore>, NodeError> {
    if database_url == "memory" {
        info!("using in-memory event log driver");
        return Ok(Arc::new(MemoryEventLog::new()));
    }
    info!(database_url, "connecting to SQL event log driver");
    Ok(Arc::new(SqlEventLog::connect(database_url).await?))
}

/// A fully wired node: event log (C1), write buffer (C5), flush strategy
/// (C4) over a bulk persister (C2), replay cache (C3), and an operation
/// router (C6). The splitter/merger (C7/C8) are run on demand by a caller
/// holding these handles — they are not spawned as background tasks here.
pub struct Node {
    /// The durable (or in-memory) event log this node writes to.
    pub event_log: Arc<dyn EventLogStore>,
    /// The write buffer collecting accepted events before a flush.
    pub write_buffer: Arc<WriteBuffer>,
    /// The bounded replay cache fed by every successful flush.
    pub replay_cache: Arc<ReplayCache>,
    /// The operation router, seeded from [`NodeConfig::shard_configuration`].
    pub router: Arc<Router>,
    flush_strategy: Arc<FlushStrategy>,
}

impl Node {
    /// Assembles a node from `config`: connects the event log, starts the
    /// flush strategy's background tasks, and builds the router's initial
    /// shard configuration.
    pub async fn build(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let event_log = connect_event_log(&config.database_url).await?;
        let replay_cache = Arc::new(ReplayCache::new(config.replay_cache_capacity));

        let sink = match &config.backup_file_path {
            Some(path) => EventSink::Redundant {
                primary: Arc::clone(&event_log),
                backup: aam_persister::BackupEventFile::new(path.clone()),
            },
            None => EventSink::Primary(Arc::clone(&event_log)),
        };
        let persister =
            Arc::new(BulkPersister::new(sink, config.storage_retry, Some(Arc::clone(&replay_cache))));

        // The write buffer must hold the very same signal the flush
        // strategy's tasks select on, so it is built before the strategy.
        let signal = aam_flush::FlushSignal::new_shared(config.buffer_size_limit);
        let write_buffer = Arc::new(WriteBuffer::new(Arc::clone(&signal)));
        let flush_strategy = Arc::new(FlushStrategy::spawn_with_signal(
            signal,
            write_buffer.clone(),
            persister,
            config.flush_loop_interval,
        ));

        let shard_configuration = config.shard_configuration_set()?;
        let router = Arc::new(Router::new(shard_configuration));

        Ok(Self { event_log, write_buffer, replay_cache, router, flush_strategy })
    }

    /// Builds a [`WriteSideAdministrator`] handle over this node's flush
    /// strategy, for a caller about to run a split or merge against it.
    pub fn write_side_administrator(&self) -> Arc<dyn WriteSideAdministrator> {
        Arc::new(FlushStrategyAdministrator::new(Arc::clone(&self.flush_strategy)))
    }

    /// Subscribes to the live stream of events admitted into the replay
    /// cache (C3), for a read replica or controller that wants to avoid
    /// polling.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<aam_types::event::Event> {
        self.replay_cache.subscribe()
    }

    /// Stops the flush strategy's background tasks, draining any events
    /// accepted before this call. Logs and returns without draining if an
    /// outstanding [`Self::write_side_administrator`] handle is still
    /// alive elsewhere (shutdown is best-effort, not a hard barrier).
    pub async fn shutdown(self) {
        match Arc::try_unwrap(self.flush_strategy) {
            Ok(strategy) => strategy.stop().await,
            Err(_) => {
                tracing::warn!("flush strategy has outstanding references; skipping drain on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::shard::{ShardConfiguration, ShardDataElement, ShardOperation};
    use std::time::Duration;

    fn memory_config() -> NodeConfig {
        NodeConfig {
            node_endpoint: "node-a".to_string(),
            database_url: "memory".to_string(),
            buffer_size_limit: 3,
            flush_loop_interval: Duration::from_secs(60),
            shard_configuration: vec![ShardConfiguration {
                data_element: ShardDataElement::User,
                operation: ShardOperation::Event,
                hash_range_start: i32::MIN,
                hash_range_end: i32::MAX,
                client_endpoint: "node-a".to_string(),
            }],
            ..NodeConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accepted_events_reach_the_event_log_on_size_trigger() {
        let config = memory_config();
        let node = Node::build(&config).await.unwrap();

        node.write_buffer.add_user("alice").unwrap();
        node.write_buffer.add_user("bob").unwrap();
        node.write_buffer.add_user("carol").unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.event_log.get_initial_event().await.unwrap().is_some(), true);

        let outcome = node
            .router
            .route(ShardDataElement::User, ShardOperation::Event, "alice")
            .await
            .unwrap();
        assert!(matches!(outcome, aam_router::RouteOutcome::Dispatch(_, _)));

        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_receives_flushed_events() {
        let config = memory_config();
        let node = Node::build(&config).await.unwrap();
        let mut rx = node.subscribe();

        node.write_buffer.add_user("alice").unwrap();
        node.write_buffer.add_user("bob").unwrap();
        node.write_buffer.add_user("carol").unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, aam_types::event::EventKind::User { user: "alice".to_string() });

        node.shutdown().await;
    }
}
