//! Status condition type following Kubernetes conventions

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// The agent writes its own conditions (`SyncConflict`, `SyncValidation`,
/// `DeletionBlocked`) into `status.conditions` of upstream objects.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., SyncConflict)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True if both conditions report the same state, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Upsert a condition by type
///
/// An unchanged condition keeps its original transition time so repeated
/// passes produce byte-identical status.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new(
            "SyncConflict",
            ConditionStatus::True,
            "BothChanged",
            "upstream and downstream spec diverged",
        );
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "SyncConflict");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());

        let parsed: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, condition);
    }

    #[test]
    fn set_condition_keeps_transition_time_when_unchanged() {
        let mut first = Condition::new("SyncConflict", ConditionStatus::True, "R", "m");
        first.last_transition_time = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let mut conditions = vec![first.clone()];

        set_condition(
            &mut conditions,
            Condition::new("SyncConflict", ConditionStatus::True, "R", "m"),
        );
        assert_eq!(conditions, vec![first]);

        set_condition(
            &mut conditions,
            Condition::new("SyncConflict", ConditionStatus::False, "Resolved", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);

        set_condition(
            &mut conditions,
            Condition::new("DeletionBlocked", ConditionStatus::True, "R", "m"),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn condition_status_default_is_unknown() {
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
        assert_eq!(ConditionStatus::False.to_string(), "False");
    }
}
