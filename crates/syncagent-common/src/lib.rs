//! Common types for the API sync agent: errors, retry, kube helpers,
//! leadership, telemetry and CRDs

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ErrorClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace for leases
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Prefix for every label, annotation and finalizer the agent owns
pub const ANNOTATION_PREFIX: &str = "syncagent.kcp.io";

/// Field manager name used for server-side writes
pub const FIELD_MANAGER: &str = "api-syncagent";
