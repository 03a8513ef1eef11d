//! Typed node configuration, loaded from a TOML file with environment
//! variable overrides.
//!
//! Grounded on `toka-store-raft::RaftClusterConfig`: a single `Default` +
//! `validate()` + builder-style `with_*` struct rather than a scattered set
//! of env lookups, generalized here from Raft cluster parameters to the
//! event pipeline's own knobs (buffer size, flush interval, shard
//! configuration, retry budgets).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aam_types::retry::RetryPolicy;
use aam_types::shard::{ShardConfiguration, ShardConfigurationSet};

use crate::error::NodeError;

/// Full configuration for one `aam-node` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's shard-group endpoint, as it appears in
    /// [`ShardConfiguration::client_endpoint`] entries that route to it.
    pub node_endpoint: String,

    /// Event log connection string: `"memory"` for the non-durable C1
    /// driver, or a `sqlite:`/`postgres:` URL for [`aam_event_log_sql`].
    pub database_url: String,

    /// Optional local backup journal path (`spec.md` §6); when set, the
    /// flush persister commits through [`aam_persister::EventSink::Redundant`]
    /// instead of [`aam_persister::EventSink::Primary`].
    pub backup_file_path: Option<PathBuf>,

    /// The shard routing table this node's [`aam_router::Router`] starts
    /// with.
    pub shard_configuration: Vec<ShardConfiguration>,

    /// Size trigger for the write buffer's flush strategy (C4).
    pub buffer_size_limit: usize,

    /// Time trigger for the write buffer's flush strategy (C4).
    pub flush_loop_interval: Duration,

    /// Capacity of the bounded replay cache (C3).
    pub replay_cache_capacity: usize,

    /// Retry budget for commits to the durable event log (C2).
    pub storage_retry: RetryPolicy,

    /// Retry budget for quiescence polling during a split/merge (C7/C8).
    pub quiescence_retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_endpoint: "node-local".to_string(),
            database_url: "memory".to_string(),
            backup_file_path: None,
            shard_configuration: Vec::new(),
            buffer_size_limit: 100,
            flush_loop_interval: Duration::from_secs(30),
            replay_cache_capacity: 10_000,
            storage_retry: RetryPolicy::new(3, Duration::from_millis(200)),
            quiescence_retry: RetryPolicy::new(5, Duration::from_millis(500)),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from `path`, then applies `AAM__*` environment
    /// overrides (double underscore separates nested keys, e.g.
    /// `AAM__BUFFER_SIZE_LIMIT=500`), matching the "Environment inputs"
    /// list in `spec.md` §6.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("AAM").separator("__"))
            .build()?;
        let loaded: NodeConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Sets the shard configuration table.
    pub fn with_shard_configuration(mut self, entries: Vec<ShardConfiguration>) -> Self {
        self.shard_configuration = entries;
        self
    }

    /// Sets the flush strategy's size/time triggers.
    pub fn with_flush_triggers(mut self, buffer_size_limit: usize, flush_loop_interval: Duration) -> Self {
        self.buffer_size_limit = buffer_size_limit;
        self.flush_loop_interval = flush_loop_interval;
        self
    }

    /// Rejects configurations that would panic or stall a running node
    /// rather than surfacing a clean startup error.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node_endpoint.is_empty() {
            return Err(NodeError::InvalidConfig("node_endpoint must not be empty".to_string()));
        }
        if self.buffer_size_limit == 0 {
            return Err(NodeError::InvalidConfig("buffer_size_limit must be at least 1".to_string()));
        }
        if self.flush_loop_interval.is_zero() {
            return Err(NodeError::InvalidConfig("flush_loop_interval must be positive".to_string()));
        }
        if self.storage_retry.max_attempts == 0 || self.quiescence_retry.max_attempts == 0 {
            return Err(NodeError::InvalidConfig("retry policies require at least one attempt".to_string()));
        }
        self.shard_configuration_set()?;
        Ok(())
    }

    /// Builds the [`ShardConfigurationSet`] the router starts with, failing
    /// on duplicate `(data_element, operation, hash_range_start)` keys.
    pub fn shard_configuration_set(&self) -> Result<ShardConfigurationSet, NodeError> {
        Ok(ShardConfigurationSet::new(self.shard_configuration.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::shard::{ShardDataElement, ShardOperation};
    use std::io::Write;

    #[test]
    fn defaults_pass_validation() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_buffer_size_limit() {
        let config = NodeConfig { buffer_size_limit: 0, ..NodeConfig::default() };
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_duplicate_shard_configuration_keys() {
        let entry = ShardConfiguration {
            data_element: ShardDataElement::User,
            operation: ShardOperation::Event,
            hash_range_start: 0,
            hash_range_end: 100,
            client_endpoint: "node-a".to_string(),
        };
        let config = NodeConfig { shard_configuration: vec![entry.clone(), entry], ..NodeConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_applies_environment_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let toml = concat!(
            "node_endpoint = \"node-a\"\n",
            "database_url = \"memory\"\n",
            "buffer_size_limit = 100\n",
            "flush_loop_interval = { secs = 30, nanos = 0 }\n",
            "replay_cache_capacity = 10000\n",
            "storage_retry = { max_attempts = 3, interval = { secs = 0, nanos = 200000000 } }\n",
            "quiescence_retry = { max_attempts = 5, interval = { secs = 0, nanos = 500000000 } }\n",
        );
        file.write_all(toml.as_bytes()).unwrap();
        file.flush().unwrap();

        std::env::set_var("AAM__BUFFER_SIZE_LIMIT", "250");
        let loaded = NodeConfig::load(file.path()).unwrap();
        std::env::remove_var("AAM__BUFFER_SIZE_LIMIT");

        assert_eq!(loaded.buffer_size_limit, 250);
        assert_eq!(loaded.node_endpoint, "node-a");
    }
}
