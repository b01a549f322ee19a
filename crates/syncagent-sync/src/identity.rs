//! Identity mapping between upstream workspaces and the downstream cluster
//!
//! Every configured workspace gets a short prefix derived from its path. The
//! prefix is embedded in the downstream namespace (namespaced resources) or
//! name (cluster-scoped resources), which keeps objects from different
//! workspaces apart and lets the downstream identity be inverted through the
//! prefix table.

use std::collections::HashMap;

use kube::api::DynamicObject;
use kube::ResourceExt;
use syncagent_common::kube_utils::hex_digest;
use syncagent_common::{Error, Result};

/// Maximum length of a namespace name (DNS label)
pub const MAX_NAMESPACE_LEN: usize = 63;
/// Maximum length of an object name (DNS subdomain)
pub const MAX_NAME_LEN: usize = 253;

/// Bytes of SHA-256 kept in a workspace prefix (12 hex chars)
const PREFIX_DIGEST_BYTES: usize = 6;

/// Namespace and name of an object within one store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectName {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectName {
    /// Name of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Name of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Namespace and name of an existing object
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identity of an object in an upstream workspace
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamKey {
    /// Workspace path (e.g. `root:org:team`)
    pub workspace: String,
    /// `group/version/resource`
    pub gvr: String,
    /// Namespace and name within the workspace
    pub object: ObjectName,
}

impl UpstreamKey {
    /// Key for an object observed in the given workspace
    pub fn for_object(workspace: &str, gvr: &str, obj: &DynamicObject) -> Self {
        Self {
            workspace: workspace.to_string(),
            gvr: gvr.to_string(),
            object: ObjectName::of(obj),
        }
    }
}

impl std::fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.workspace, self.gvr, self.object)
    }
}

/// Identity of an object in the downstream cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DownstreamKey {
    /// Downstream cluster identity (the agent name)
    pub cluster: String,
    /// Namespace and name in the downstream cluster
    pub object: ObjectName,
}

impl DownstreamKey {
    /// Key for an object observed in the downstream cluster
    pub fn for_object(cluster: &str, obj: &DynamicObject) -> Self {
        Self {
            cluster: cluster.to_string(),
            object: ObjectName::of(obj),
        }
    }
}

impl std::fmt::Display for DownstreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.cluster, self.object)
    }
}

/// Prefix embedded in downstream identities for a workspace
///
/// `w` followed by the first 12 hex chars of SHA-256 over the workspace path.
/// Always 13 characters and never contains `-`.
pub fn workspace_prefix(workspace: &str) -> String {
    format!("w{}", hex_digest(workspace, PREFIX_DIGEST_BYTES))
}

/// Bidirectional mapping for one resource type
#[derive(Clone, Debug)]
pub struct IdentityMapper {
    cluster: String,
    gvr: String,
    by_prefix: HashMap<String, String>,
    by_workspace: HashMap<String, String>,
}

impl IdentityMapper {
    /// Build the prefix table for the configured workspaces
    ///
    /// Fails with [`Error::IdentityCollision`] if two workspaces share a prefix.
    pub fn new(cluster: &str, gvr: &str, workspaces: &[String]) -> Result<Self> {
        let mut by_prefix: HashMap<String, String> = HashMap::new();
        let mut by_workspace = HashMap::new();

        for workspace in workspaces {
            if by_workspace.contains_key(workspace) {
                continue;
            }
            let prefix = workspace_prefix(workspace);
            if let Some(first) = by_prefix.get(&prefix) {
                return Err(Error::IdentityCollision {
                    prefix,
                    first: first.clone(),
                    second: workspace.clone(),
                });
            }
            by_prefix.insert(prefix.clone(), workspace.clone());
            by_workspace.insert(workspace.clone(), prefix);
        }

        Ok(Self {
            cluster: cluster.to_string(),
            gvr: gvr.to_string(),
            by_prefix,
            by_workspace,
        })
    }

    /// Downstream cluster identity
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Configured workspaces
    pub fn workspaces(&self) -> impl Iterator<Item = &str> {
        self.by_workspace.keys().map(String::as_str)
    }

    /// Map an upstream identity to its downstream identity
    pub fn to_downstream(&self, key: &UpstreamKey) -> Result<DownstreamKey> {
        let prefix = self.by_workspace.get(&key.workspace).ok_or_else(|| {
            Error::validation_for(
                key.to_string(),
                format!("workspace {} is not configured", key.workspace),
            )
        })?;

        let object = match &key.object.namespace {
            Some(ns) => {
                let namespace = format!("{}-{}", prefix, ns);
                if namespace.len() > MAX_NAMESPACE_LEN {
                    return Err(Error::validation_for_field(
                        key.to_string(),
                        "metadata.namespace",
                        format!(
                            "downstream namespace {} exceeds {} characters",
                            namespace, MAX_NAMESPACE_LEN
                        ),
                    ));
                }
                ObjectName::namespaced(namespace, key.object.name.clone())
            }
            None => {
                let name = format!("{}-{}", prefix, key.object.name);
                if name.len() > MAX_NAME_LEN {
                    return Err(Error::validation_for_field(
                        key.to_string(),
                        "metadata.name",
                        format!("downstream name exceeds {} characters", MAX_NAME_LEN),
                    ));
                }
                ObjectName::cluster(name)
            }
        };

        Ok(DownstreamKey {
            cluster: self.cluster.clone(),
            object,
        })
    }

    /// Map a downstream identity back to the upstream identity it mirrors
    pub fn to_upstream(&self, key: &DownstreamKey) -> Result<UpstreamKey> {
        let mapped = key
            .object
            .namespace
            .as_deref()
            .unwrap_or(key.object.name.as_str());
        let (prefix, rest) = mapped.split_once('-').ok_or_else(|| {
            Error::validation_for(key.to_string(), "downstream identity carries no workspace prefix")
        })?;
        let workspace = self.by_prefix.get(prefix).ok_or_else(|| {
            Error::validation_for(
                key.to_string(),
                format!("prefix {} matches no configured workspace", prefix),
            )
        })?;

        let object = match &key.object.namespace {
            Some(_) => ObjectName::namespaced(rest, key.object.name.clone()),
            None => ObjectName::cluster(rest),
        };

        Ok(UpstreamKey {
            workspace: workspace.clone(),
            gvr: self.gvr.clone(),
            object,
        })
    }
}
