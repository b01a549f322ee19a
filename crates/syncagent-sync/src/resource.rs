//! Resource types the engine synchronizes

use kube::discovery::{ApiCapabilities, ApiResource, Scope};

/// A synchronized resource type, as resolved from discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceType {
    /// API group ("" for core)
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub plural: String,
    /// Whether objects live in namespaces
    pub namespaced: bool,
    /// Whether the resource serves a status subresource
    pub has_status: bool,
}

impl ResourceType {
    /// Build from discovery output
    pub fn from_discovery(ar: &ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            group: ar.group.clone(),
            version: ar.version.clone(),
            kind: ar.kind.clone(),
            plural: ar.plural.clone(),
            namespaced: caps.scope == Scope::Namespaced,
            has_status: caps
                .subresources
                .iter()
                .any(|(sub, _)| sub.plural == "status" || sub.plural.ends_with("/status")),
        }
    }

    /// `group/version/resource`, the identity used in keys and logs
    pub fn gvr(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.plural)
    }

    /// `apiVersion` as written on objects
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// kube-rs dynamic API descriptor
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.plural, self.group)
    }
}

#[cfg(test)]
pub(crate) fn thing() -> ResourceType {
    ResourceType {
        group: "dummy.kcp.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "Thing".to_string(),
        plural: "things".to_string(),
        namespaced: false,
        has_status: true,
    }
}
