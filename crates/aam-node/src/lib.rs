#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-node** – Process wiring / builder facade for the ApplicationAccess
//! sharded event pipeline.
//!
//! Loads a typed [`config::NodeConfig`] from a TOML file plus environment
//! overrides and assembles C1–C6 into one [`node::Node`], the way
//! `toka-runtime::Runtime::new` assembles its bus/storage/kernel
//! collaborators from a `RuntimeConfig`. The HTTP/REST surface described in
//! `spec.md` §6 is an external collaborator and is out of scope here — this
//! crate stops at the plain Rust handles a controller process would hold.

/// Typed configuration loaded from a TOML file with environment overrides.
pub mod config;
/// Process-level error type.
pub mod error;
/// Adapts C4's flush strategy to the redistribution crate's administrator hook.
pub mod flush_admin;
/// The builder facade assembling a running node.
pub mod node;

pub use config::NodeConfig;
pub use error::NodeError;
pub use flush_admin::FlushStrategyAdministrator;
pub use node::Node;
