//! Process-level error type, wrapping the pipeline's shared taxonomy with
//! the configuration-loading failures that only a running process can hit.

use aam_types::error::AamError;

/// Errors surfaced while loading configuration or assembling a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The `config` crate failed to merge the file/environment sources or
    /// deserialize the result into [`crate::config::NodeConfig`].
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A loaded configuration value failed a cross-field check in
    /// [`crate::config::NodeConfig::validate`].
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline operation (connecting the event log, replaying, etc.)
    /// failed during startup.
    #[error(transparent)]
    Pipeline(#[from] AamError),
}
