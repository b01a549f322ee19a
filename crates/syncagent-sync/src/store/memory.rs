//! In-memory object store
//!
//! Behaves like an API server for one resource type: monotonically increasing
//! resource versions, conditional writes, finalizer-aware deletion, a status
//! subresource and a resumable watch. Used to run the whole engine without a
//! cluster.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use syncagent_common::{Error, Result};
use tokio::sync::broadcast;

use super::{EventStream, ObjectList, ObjectStore, StoreEvent};
use crate::identity::ObjectName;
use crate::state::spec_content;
use crate::status::apply_merge_patch;

/// Events retained for resuming watches
const HISTORY_LIMIT: usize = 4096;
/// Buffered events per watcher before it must relist
const CHANNEL_CAPACITY: usize = 1024;

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectName, DynamicObject>,
    revision: u64,
    history: VecDeque<(u64, StoreEvent)>,
    writes: u64,
    pending_failures: u32,
    namespaces: BTreeSet<String>,
}

/// In-process [`ObjectStore`]
#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    namespaced: bool,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(u64, StoreEvent)>,
}

impl MemoryStore {
    /// Store for a cluster-scoped resource
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }

    /// Store for a namespaced resource
    pub fn namespaced(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    fn new(name: impl Into<String>, namespaced: bool) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            namespaced,
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of an object, without going through the async API
    pub fn snapshot(&self, name: &ObjectName) -> Option<DynamicObject> {
        self.lock().objects.get(name).cloned()
    }

    /// Names of all stored objects
    pub fn names(&self) -> Vec<ObjectName> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// True if no objects are stored
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Number of successful mutating calls so far
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Namespaces passed to `ensure_namespace`
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    /// Make the next `count` calls fail with 503 Service Unavailable
    pub fn inject_failures(&self, count: u32) {
        self.lock().pending_failures = count;
    }

    /// Read-modify-write an object, as an external client would
    pub async fn modify(
        &self,
        name: &ObjectName,
        edit: impl FnOnce(&mut DynamicObject) + Send,
    ) -> Result<DynamicObject> {
        let mut obj = self
            .get(name)
            .await?
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        edit(&mut obj);
        self.update(&obj).await
    }

    /// Replace an object's status, as the downstream owner would
    pub async fn set_status(&self, name: &ObjectName, status: Value) -> Result<DynamicObject> {
        let current = self
            .get(name)
            .await?
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        let patch = crate::status::merge_patch(
            current.data.get("status").unwrap_or(&Value::Null),
            &status,
        );
        self.patch_status(name, &current.resource_version().unwrap_or_default(), &patch)
            .await
    }

    fn check_fault(inner: &mut Inner) -> Result<()> {
        if inner.pending_failures > 0 {
            inner.pending_failures -= 1;
            return Err(api_error(
                503,
                "ServiceUnavailable",
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }

    fn normalize(&self, name: &ObjectName) -> Result<ObjectName> {
        match (&name.namespace, self.namespaced) {
            (Some(_), true) | (None, false) => Ok(name.clone()),
            (None, true) => Err(api_error(
                400,
                "BadRequest",
                format!("{name}: namespace is required"),
            )),
            (Some(_), false) => Ok(ObjectName::cluster(name.name.clone())),
        }
    }

    /// Bump the revision, stamp the object and publish the event
    fn commit(
        &self,
        inner: &mut Inner,
        obj: &mut DynamicObject,
        event: fn(DynamicObject) -> StoreEvent,
    ) {
        inner.revision += 1;
        inner.writes += 1;
        obj.metadata.resource_version = Some(inner.revision.to_string());
        let ev = event(obj.clone());
        inner.history.push_back((inner.revision, ev.clone()));
        if inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
        // No receivers is fine
        let _ = self.events.send((inner.revision, ev));
    }

    fn check_version(
        name: &ObjectName,
        stored: &DynamicObject,
        expected: Option<&str>,
    ) -> Result<()> {
        match expected {
            Some(rv) if stored.metadata.resource_version.as_deref() != Some(rv) => {
                Err(Error::conflict(
                    name.to_string(),
                    format!(
                        "resource version {} does not match {}",
                        rv,
                        stored.metadata.resource_version.as_deref().unwrap_or("")
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn list(&self) -> Result<ObjectList> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        Ok(ObjectList {
            items: inner.objects.values().cloned().collect(),
            resource_version: Some(inner.revision.to_string()),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream> {
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        let from: u64 = resource_version.parse().map_err(|_| {
            api_error(
                400,
                "BadRequest",
                format!("invalid resource version {resource_version:?}"),
            )
        })?;
        if let Some((oldest, _)) = inner.history.front() {
            if from + 1 < *oldest {
                return Err(api_error(
                    410,
                    "Expired",
                    format!("resource version {from} is too old"),
                ));
            }
        }

        let replay: Vec<Result<StoreEvent>> = inner
            .history
            .iter()
            .filter(|(rev, _)| *rev > from)
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        let replayed_to = inner.revision.max(from);
        // Subscribe while holding the lock so no event falls between replay and live
        let rx = self.events.subscribe();
        drop(inner);

        let live = futures::stream::unfold((rx, replayed_to), |(mut rx, last)| async move {
            loop {
                match rx.recv().await {
                    Ok((rev, _)) if rev <= last => continue,
                    Ok((rev, ev)) => return Some((Ok(ev), (rx, rev))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((
                            Err(Error::internal_with_context(
                                "memory-watch",
                                format!("watcher lagged by {n} events"),
                            )),
                            (rx, last),
                        ))
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn get(&self, name: &ObjectName) -> Result<Option<DynamicObject>> {
        let name = self.normalize(name)?;
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        Ok(inner.objects.get(&name).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = self.normalize(&ObjectName::of(obj))?;
        if name.name.is_empty() {
            return Err(api_error(400, "BadRequest", "name is required".to_string()));
        }
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        if inner.objects.contains_key(&name) {
            return Err(Error::conflict(
                name.to_string(),
                "object already exists".to_string(),
            ));
        }

        let mut created = obj.clone();
        created.metadata.namespace = name.namespace.clone();
        created.metadata.uid = Some(format!("uid-{}", inner.revision + 1));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.deletion_timestamp = None;
        created.metadata.generation = Some(1);
        if let Value::Object(map) = &mut created.data {
            map.remove("status");
        }
        self.commit(&mut inner, &mut created, StoreEvent::Added);
        inner.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = self.normalize(&ObjectName::of(obj))?;
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        let stored = inner
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        Self::check_version(&name, &stored, obj.metadata.resource_version.as_deref())?;

        if stored.metadata.deletion_timestamp.is_some() {
            let added = obj
                .finalizers()
                .iter()
                .any(|f| !stored.finalizers().contains(f));
            if added {
                return Err(api_error(
                    422,
                    "Invalid",
                    format!("{name}: no new finalizers can be added while deleting"),
                ));
            }
        }

        let mut updated = obj.clone();
        updated.metadata.namespace = name.namespace.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        let generation = stored.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if spec_content(&updated) != spec_content(&stored) {
            generation + 1
        } else {
            generation
        });
        if let Value::Object(map) = &mut updated.data {
            match stored.data.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            self.commit(&mut inner, &mut updated, StoreEvent::Deleted);
            inner.objects.remove(&name);
        } else {
            self.commit(&mut inner, &mut updated, StoreEvent::Modified);
            inner.objects.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn patch_status(
        &self,
        name: &ObjectName,
        resource_version: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let name = self.normalize(name)?;
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        let mut updated = inner
            .objects
            .get(&name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        let expected = Some(resource_version).filter(|rv| !rv.is_empty());
        Self::check_version(&name, &updated, expected)?;

        if !updated.data.is_object() {
            updated.data = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut updated.data {
            let status = map.entry("status".to_string()).or_insert(Value::Null);
            apply_merge_patch(status, patch);
        }
        self.commit(&mut inner, &mut updated, StoreEvent::Modified);
        inner.objects.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &ObjectName, resource_version: Option<String>) -> Result<()> {
        let name = self.normalize(name)?;
        let mut inner = self.lock();
        Self::check_fault(&mut inner)?;
        let Some(stored) = inner.objects.get(&name).cloned() else {
            return Ok(());
        };
        Self::check_version(&name, &stored, resource_version.as_deref())?;

        let mut obj = stored;
        if !obj.finalizers().is_empty() {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                self.commit(&mut inner, &mut obj, StoreEvent::Modified);
                inner.objects.insert(name, obj);
            }
            return Ok(());
        }

        self.commit(&mut inner, &mut obj, StoreEvent::Deleted);
        inner.objects.remove(&name);
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.namespaced {
            self.lock().namespaces.insert(namespace.to_string());
        }
        Ok(())
    }
}
