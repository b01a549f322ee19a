//! Thing CRD, the example payload used by the end-to-end tests
//!
//! The engine never interprets these fields; it copies and hashes `spec` and
//! mirrors `status` like any other resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// A Thing is an arbitrary cluster-scoped object with a small spec.
///
/// Example:
/// ```yaml
/// apiVersion: dummy.kcp.io/v1alpha1
/// kind: Thing
/// metadata:
///   name: my-thing
/// spec:
///   username: a
///   kink: x
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dummy.kcp.io",
    version = "v1alpha1",
    kind = "Thing",
    plural = "things",
    status = "ThingStatus",
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ThingSpec {
    /// Owner's user name
    pub username: String,

    /// Free-form preference
    pub kink: String,

    /// Optional address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Observed state of a Thing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThingStatus {
    /// Free-form phase reported by whatever serves the Thing downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Conditions, including those written by the sync agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
