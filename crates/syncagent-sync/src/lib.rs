//! Bidirectional synchronization between kcp workspaces and a downstream cluster
//!
//! Upstream objects are projected into the downstream cluster under a
//! deterministic identity; downstream status flows back upstream. The pieces,
//! leaf first:
//!
//! - [`identity`]: upstream and downstream object identities and the mapping
//! - [`state`]: sync bookkeeping persisted on downstream objects
//! - [`conflict`], [`status`], [`finalizer`]: pure decision logic
//! - [`store`]: the object store capability both sides are accessed through
//! - [`queue`], [`watcher`]: event intake
//! - [`reconciler`], [`controller`]: the sync engine

#![deny(missing_docs)]

pub mod conflict;
pub mod controller;
pub mod finalizer;
pub mod identity;
pub mod queue;
pub mod reconciler;
pub mod resource;
pub mod state;
pub mod status;
pub mod store;
pub mod watcher;

pub use conflict::SpecDriftPolicy;
pub use controller::{run_workers, Engine, EngineConfig, Reconcile};
pub use identity::{DownstreamKey, IdentityMapper, ObjectName, UpstreamKey};
pub use queue::{Reason, WorkItem, WorkQueue};
pub use reconciler::{Outcome, Reconciler, ReconcilerConfig, SyncDecision};
pub use resource::ResourceType;
pub use state::VersionTracker;
pub use store::{KubeStore, MemoryStore, ObjectStore};
