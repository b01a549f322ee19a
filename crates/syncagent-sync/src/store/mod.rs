//! Object store capability over one resource type in one cluster
//!
//! The engine talks to both sides exclusively through [`ObjectStore`].
//! [`KubeStore`] is backed by the Kubernetes API; [`MemoryStore`] is an
//! in-process implementation with the same concurrency semantics.

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use serde_json::Value;
use syncagent_common::Result;

#[cfg(test)]
use mockall::automock;

use crate::identity::ObjectName;

/// Result of a list call
#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    /// Objects in the collection
    pub items: Vec<DynamicObject>,
    /// Collection resource version to watch from
    pub resource_version: Option<String>,
}

/// One event from a watch stream
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// Object created
    Added(DynamicObject),
    /// Object changed
    Modified(DynamicObject),
    /// Object removed
    Deleted(DynamicObject),
    /// Progress marker carrying a collection resource version
    Bookmark(String),
}

/// Stream of watch events; an `Err` item means the caller must relist, a clean
/// end means the watch can be resumed from the last delivered version
pub type EventStream = BoxStream<'static, Result<StoreEvent>>;

/// Capability-typed remote store for one resource type
///
/// Writes are conditional: `update` and `delete` fail with
/// [`Error::Conflict`](syncagent_common::Error::Conflict) if the object's
/// resource version moved.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// List all objects of the resource type
    async fn list(&self) -> Result<ObjectList>;

    /// Watch for changes after the given collection resource version
    async fn watch(&self, resource_version: &str) -> Result<EventStream>;

    /// Get an object, `None` if it does not exist
    async fn get(&self, name: &ObjectName) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object, conditional on `metadata.resourceVersion`
    ///
    /// The status is not written.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Merge-patch the status subresource, conditional on `resource_version`
    async fn patch_status(
        &self,
        name: &ObjectName,
        resource_version: &str,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Delete an object, optionally conditional on a resource version
    ///
    /// Deleting an object that does not exist succeeds.
    async fn delete(&self, name: &ObjectName, resource_version: Option<String>) -> Result<()>;

    /// Make sure a namespace exists before objects are created in it
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;
}
