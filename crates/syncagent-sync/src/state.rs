//! Sync state persisted on downstream objects
//!
//! Bookkeeping lives in a fixed set of labels and annotations on the
//! downstream mirror, so it survives restarts without external storage. The
//! downstream resource version written by the agent cannot be stored inside
//! the object it describes; it is tracked in memory by [`VersionTracker`] and
//! re-seeded from observed objects after a restart.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use syncagent_common::kube_utils::deterministic_hash;

use crate::identity::{DownstreamKey, UpstreamKey};

/// Label marking a downstream object as managed by an agent (value: agent name)
pub const AGENT_LABEL: &str = "syncagent.kcp.io/agent";
/// Workspace path of the upstream object
pub const UPSTREAM_WORKSPACE_ANNOTATION: &str = "syncagent.kcp.io/upstream-workspace";
/// Namespace of the upstream object (absent for cluster-scoped objects)
pub const UPSTREAM_NAMESPACE_ANNOTATION: &str = "syncagent.kcp.io/upstream-namespace";
/// Name of the upstream object
pub const UPSTREAM_NAME_ANNOTATION: &str = "syncagent.kcp.io/upstream-name";
/// Upstream resource version last applied downstream
pub const LAST_UPSTREAM_RV_ANNOTATION: &str = "syncagent.kcp.io/last-upstream-resource-version";
/// Hash of the spec content last applied downstream
pub const LAST_SPEC_HASH_ANNOTATION: &str = "syncagent.kcp.io/last-synced-spec-hash";
/// Set to "true" once the agent starts deleting the downstream object
pub const DELETION_IN_PROGRESS_ANNOTATION: &str = "syncagent.kcp.io/deletion-in-progress";
/// RFC 3339 time at which the agent started deleting the downstream object
pub const DELETING_SINCE_ANNOTATION: &str = "syncagent.kcp.io/deleting-since";

/// Prefix shared by every key above
const AGENT_KEY_PREFIX: &str = "syncagent.kcp.io/";

/// Annotation that must never be copied between clusters
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Top-level fields that are not spec content
const NON_SPEC_FIELDS: &[&str] = &["status"];

/// Everything of an object except metadata and status
///
/// For most resources this is `{"spec": ...}`; resources with other top-level
/// fields (e.g. `data`) are covered as well.
pub fn spec_content(obj: &DynamicObject) -> Value {
    match &obj.data {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !NON_SPEC_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => Value::Object(Default::default()),
    }
}

/// Hash of an object's spec content
///
/// serde_json maps are ordered, so the serialization is canonical.
pub fn spec_hash(obj: &DynamicObject) -> String {
    deterministic_hash(&spec_content(obj).to_string())
}

/// The object's status, if any
pub fn status_of(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status").filter(|v| !v.is_null())
}

/// Sync bookkeeping read from a downstream object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Agent that owns the object
    pub agent: Option<String>,
    /// Upstream workspace path
    pub upstream_workspace: Option<String>,
    /// Upstream namespace
    pub upstream_namespace: Option<String>,
    /// Upstream name
    pub upstream_name: Option<String>,
    /// Upstream resource version last applied
    pub last_upstream_resource_version: Option<String>,
    /// Spec hash last applied
    pub last_synced_spec_hash: Option<String>,
    /// Deletion has been started by the agent
    pub deletion_in_progress: bool,
    /// When the agent started the deletion
    pub deleting_since: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Read state from a downstream object's labels and annotations
    pub fn from_object(obj: &DynamicObject) -> Self {
        let annotations = obj.annotations();
        let get = |k: &str| annotations.get(k).cloned();
        Self {
            agent: obj.labels().get(AGENT_LABEL).cloned(),
            upstream_workspace: get(UPSTREAM_WORKSPACE_ANNOTATION),
            upstream_namespace: get(UPSTREAM_NAMESPACE_ANNOTATION),
            upstream_name: get(UPSTREAM_NAME_ANNOTATION),
            last_upstream_resource_version: get(LAST_UPSTREAM_RV_ANNOTATION),
            last_synced_spec_hash: get(LAST_SPEC_HASH_ANNOTATION),
            deletion_in_progress: annotations
                .get(DELETION_IN_PROGRESS_ANNOTATION)
                .is_some_and(|v| v == "true"),
            deleting_since: annotations
                .get(DELETING_SINCE_ANNOTATION)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// True if the object carries this agent's ownership label
    pub fn is_owned_by(&self, agent: &str) -> bool {
        self.agent.as_deref() == Some(agent)
    }
}

/// True if the downstream object is managed by the given agent
pub fn is_managed_by(obj: &DynamicObject, agent: &str) -> bool {
    obj.labels().get(AGENT_LABEL).is_some_and(|v| v == agent)
}

/// Full view of one synchronized object, assembled for a reconcile pass
#[derive(Clone, Debug)]
pub struct TrackedObject {
    /// Upstream identity
    pub upstream: UpstreamKey,
    /// Downstream identity
    pub downstream: DownstreamKey,
    /// Persisted state read from the downstream mirror
    pub state: SyncState,
    /// Downstream resource version last written or observed by the agent
    pub last_downstream_resource_version: Option<String>,
}

fn copyable(key: &str) -> bool {
    !key.starts_with(AGENT_KEY_PREFIX) && key != LAST_APPLIED_ANNOTATION
}

fn user_labels(obj: &DynamicObject) -> impl Iterator<Item = (&String, &String)> {
    obj.labels().iter().filter(|(k, _)| copyable(k))
}

fn user_annotations(obj: &DynamicObject) -> impl Iterator<Item = (&String, &String)> {
    obj.annotations().iter().filter(|(k, _)| copyable(k))
}

fn write_sync_annotations(
    annotations: &mut BTreeMap<String, String>,
    upstream: &UpstreamKey,
    upstream_rv: &str,
    hash: &str,
) {
    annotations.insert(
        UPSTREAM_WORKSPACE_ANNOTATION.to_string(),
        upstream.workspace.clone(),
    );
    match &upstream.object.namespace {
        Some(ns) => {
            annotations.insert(UPSTREAM_NAMESPACE_ANNOTATION.to_string(), ns.clone());
        }
        None => {
            annotations.remove(UPSTREAM_NAMESPACE_ANNOTATION);
        }
    }
    annotations.insert(
        UPSTREAM_NAME_ANNOTATION.to_string(),
        upstream.object.name.clone(),
    );
    annotations.insert(
        LAST_UPSTREAM_RV_ANNOTATION.to_string(),
        upstream_rv.to_string(),
    );
    annotations.insert(LAST_SPEC_HASH_ANNOTATION.to_string(), hash.to_string());
}

/// Build a new downstream mirror of an upstream object
pub fn project(
    upstream_obj: &DynamicObject,
    upstream: &UpstreamKey,
    downstream: &DownstreamKey,
    agent: &str,
) -> DynamicObject {
    let mut obj = DynamicObject {
        types: upstream_obj.types.clone(),
        metadata: Default::default(),
        data: spec_content(upstream_obj),
    };
    obj.metadata.name = Some(downstream.object.name.clone());
    obj.metadata.namespace = downstream.object.namespace.clone();

    let mut labels: BTreeMap<String, String> = user_labels(upstream_obj)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(AGENT_LABEL.to_string(), agent.to_string());
    obj.metadata.labels = Some(labels);

    let mut annotations: BTreeMap<String, String> = user_annotations(upstream_obj)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    write_sync_annotations(
        &mut annotations,
        upstream,
        &upstream_obj.resource_version().unwrap_or_default(),
        &spec_hash(upstream_obj),
    );
    obj.metadata.annotations = Some(annotations);
    obj
}

/// Overwrite a downstream mirror's spec content with the upstream's
///
/// Upstream labels and annotations are layered over the downstream ones;
/// downstream-only keys and the status are kept. The resource version is
/// preserved so the write is conditional.
pub fn apply_upstream_spec(
    downstream_obj: &DynamicObject,
    upstream_obj: &DynamicObject,
    upstream: &UpstreamKey,
) -> DynamicObject {
    let mut obj = downstream_obj.clone();

    let mut data = spec_content(upstream_obj);
    if let (Value::Object(map), Some(status)) = (&mut data, status_of(downstream_obj)) {
        map.insert("status".to_string(), status.clone());
    }
    obj.data = data;

    let labels = obj.labels_mut();
    for (k, v) in user_labels(upstream_obj) {
        labels.insert(k.clone(), v.clone());
    }
    let annotations = obj.annotations_mut();
    for (k, v) in user_annotations(upstream_obj) {
        annotations.insert(k.clone(), v.clone());
    }
    write_sync_annotations(
        annotations,
        upstream,
        &upstream_obj.resource_version().unwrap_or_default(),
        &spec_hash(upstream_obj),
    );
    obj
}

/// Record the upstream spec hash on a mirror whose content already matches
pub fn record_synced(
    downstream_obj: &DynamicObject,
    upstream_obj: &DynamicObject,
    upstream: &UpstreamKey,
) -> DynamicObject {
    let mut obj = downstream_obj.clone();
    write_sync_annotations(
        obj.annotations_mut(),
        upstream,
        &upstream_obj.resource_version().unwrap_or_default(),
        &spec_hash(upstream_obj),
    );
    obj
}

/// Mark a mirror as being deleted by the agent
pub fn mark_deleting(downstream_obj: &DynamicObject, since: DateTime<Utc>) -> DynamicObject {
    let mut obj = downstream_obj.clone();
    let annotations = obj.annotations_mut();
    annotations.insert(
        DELETION_IN_PROGRESS_ANNOTATION.to_string(),
        "true".to_string(),
    );
    annotations.insert(
        DELETING_SINCE_ANNOTATION.to_string(),
        since.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    obj
}

/// Resource versions last written or observed by the agent, per object
///
/// Watch events carrying exactly these versions are echoes of state the
/// engine has already acted on and are not re-queued.
#[derive(Debug, Default)]
pub struct VersionTracker {
    upstream: DashMap<UpstreamKey, String>,
    downstream: DashMap<DownstreamKey, String>,
}

impl VersionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an upstream version the engine has acted on
    pub fn record_upstream(&self, key: &UpstreamKey, obj: &DynamicObject) {
        if let Some(rv) = obj.resource_version() {
            self.upstream.insert(key.clone(), rv);
        }
    }

    /// Remember a downstream version the engine wrote or acted on
    pub fn record_downstream(&self, key: &DownstreamKey, obj: &DynamicObject) {
        if let Some(rv) = obj.resource_version() {
            self.downstream.insert(key.clone(), rv);
        }
    }

    /// The last downstream version for a key
    pub fn last_downstream(&self, key: &DownstreamKey) -> Option<String> {
        self.downstream.get(key).map(|rv| rv.value().clone())
    }

    /// True if this upstream event carries a version already acted on
    pub fn is_upstream_echo(&self, key: &UpstreamKey, obj: &DynamicObject) -> bool {
        match (self.upstream.get(key), obj.resource_version()) {
            (Some(known), Some(rv)) => *known == rv,
            _ => false,
        }
    }

    /// True if this downstream event carries a version already acted on
    pub fn is_downstream_echo(&self, key: &DownstreamKey, obj: &DynamicObject) -> bool {
        match (self.downstream.get(key), obj.resource_version()) {
            (Some(known), Some(rv)) => *known == rv,
            _ => false,
        }
    }

    /// Drop all state for an object that is gone on both sides
    pub fn forget(&self, upstream: &UpstreamKey, downstream: &DownstreamKey) {
        self.upstream.remove(upstream);
        self.downstream.remove(downstream);
    }

    /// Number of tracked objects (upstream side)
    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty() && self.downstream.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use kube::api::{ApiResource, DynamicObject};
    use serde_json::{json, Value};

    use crate::resource::thing;

    /// A Thing with the given name, spec and resource version
    pub fn thing_obj(name: &str, spec: Value, rv: &str) -> DynamicObject {
        let ar: ApiResource = thing().api_resource();
        let mut obj = DynamicObject::new(name, &ar).data(json!({ "spec": spec }));
        obj.metadata.resource_version = Some(rv.to_string());
        obj
    }
}
