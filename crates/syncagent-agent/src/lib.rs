//! The api-syncagent process: CLI, APIExport binding and leader-gated engines

#![deny(missing_docs)]

/// APIExport schema resolution
pub mod binding;
/// Command line flags and validated configuration
pub mod config;
/// Leader election and engine supervision
pub mod runner;

pub use config::{AgentConfig, Cli};
pub use runner::{connect, Binding, Leadership, Supervisor};
