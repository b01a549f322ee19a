//! Status back-propagation from downstream to upstream
//!
//! The downstream status is authoritative. Conditions owned by the agent are
//! computed each pass and merged into the upstream copy; everything else in
//! `status` is taken verbatim from the downstream object.

use serde_json::{Map, Value};
use syncagent_common::crd::{set_condition, Condition, ConditionStatus};

/// Spec changed on both sides since the last sync, or drift is preserved
pub const CONDITION_SYNC_CONFLICT: &str = "SyncConflict";
/// The object cannot be projected downstream
pub const CONDITION_SYNC_VALIDATION: &str = "SyncValidation";
/// Downstream deletion has not completed in time
pub const CONDITION_DELETION_BLOCKED: &str = "DeletionBlocked";

/// Condition types the agent owns on upstream objects
pub const AGENT_CONDITIONS: &[&str] = &[
    CONDITION_SYNC_CONFLICT,
    CONDITION_SYNC_VALIDATION,
    CONDITION_DELETION_BLOCKED,
];

/// Condition reporting a spec conflict held without writing
pub fn conflict_held(upstream_hash: &str, downstream_hash: &str) -> Condition {
    Condition::new(
        CONDITION_SYNC_CONFLICT,
        ConditionStatus::True,
        "SpecConflict",
        format!(
            "upstream ({upstream_hash}) and downstream ({downstream_hash}) spec both changed since the last sync"
        ),
    )
}

/// Condition reporting downstream drift left in place by policy
pub fn drift_preserved(downstream_hash: &str) -> Condition {
    Condition::new(
        CONDITION_SYNC_CONFLICT,
        ConditionStatus::True,
        "DownstreamDrift",
        format!("downstream spec ({downstream_hash}) was edited and is preserved by policy"),
    )
}

/// Condition reporting an object that cannot be projected
pub fn validation_failed(message: &str) -> Condition {
    Condition::new(
        CONDITION_SYNC_VALIDATION,
        ConditionStatus::True,
        "InvalidObject",
        message,
    )
}

/// Condition reporting a downstream deletion that has not completed
pub fn deletion_blocked(downstream: &str, waited_secs: i64) -> Condition {
    Condition::new(
        CONDITION_DELETION_BLOCKED,
        ConditionStatus::True,
        "DownstreamNotDeleted",
        format!("downstream object {downstream} still exists after {waited_secs}s"),
    )
}

fn conditions_of(status: Option<&Value>) -> Vec<Value> {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn condition_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn is_agent_condition(value: &Value) -> bool {
    condition_type(value).is_some_and(|t| AGENT_CONDITIONS.contains(&t))
}

/// Compute the upstream status for this pass
///
/// `base` is the status to publish (the downstream status, or the current
/// upstream status when there is no downstream object). Agent conditions
/// already present upstream keep their transition time if unchanged.
/// Returns `None` when the result is empty.
pub fn desired_upstream_status(
    base: Option<&Value>,
    current_upstream: Option<&Value>,
    agent_conditions: &[Condition],
) -> Option<Value> {
    let mut status = match base {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let mut conditions: Vec<Value> = conditions_of(base)
        .into_iter()
        .filter(|c| !is_agent_condition(c))
        .collect();

    let mut existing: Vec<Condition> = conditions_of(current_upstream)
        .into_iter()
        .filter(is_agent_condition)
        .filter_map(|c| serde_json::from_value(c).ok())
        .collect();
    existing.retain(|c| agent_conditions.iter().any(|a| a.type_ == c.type_));
    for condition in agent_conditions {
        set_condition(&mut existing, condition.clone());
    }
    conditions.extend(
        existing
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok()),
    );

    if conditions.is_empty() {
        status.remove("conditions");
    } else {
        status.insert("conditions".to_string(), Value::Array(conditions));
    }

    if status.is_empty() {
        None
    } else {
        Some(Value::Object(status))
    }
}

/// RFC 7386 merge patch turning `current` into `desired`
///
/// Keys missing from `desired` are set to null so the patch removes them.
pub fn merge_patch(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(cur), Value::Object(want)) => {
            let mut patch = Map::new();
            for (k, v) in want {
                match cur.get(k) {
                    Some(old) if old == v => {}
                    Some(old) => {
                        patch.insert(k.clone(), merge_patch(old, v));
                    }
                    None => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            for k in cur.keys() {
                if !want.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// Apply an RFC 7386 merge patch in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                apply_merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    mod desired_status {
        use super::*;

        /// Story: downstream status replaces the upstream status wholesale
        #[test]
        fn story_downstream_status_is_authoritative() {
            let d = json!({"phase": "Ready", "conditions": [{"type": "Ready", "status": "True"}]});
            let u = json!({"phase": "Pending", "stale": true});
            let desired = desired_upstream_status(Some(&d), Some(&u), &[]).unwrap();
            assert_eq!(desired, d);
        }

        #[test]
        fn agent_conditions_are_merged_in() {
            let d = json!({"phase": "Ready"});
            let desired =
                desired_upstream_status(Some(&d), None, &[conflict_held("a", "b")]).unwrap();
            let conditions = desired["conditions"].as_array().unwrap();
            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0]["type"], CONDITION_SYNC_CONFLICT);
            assert_eq!(conditions[0]["reason"], "SpecConflict");
        }

        #[test]
        fn unchanged_agent_condition_keeps_transition_time() {
            let mut held = conflict_held("a", "b");
            held.last_transition_time = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
            let current = json!({"conditions": [serde_json::to_value(&held).unwrap()]});

            let desired =
                desired_upstream_status(None, Some(&current), &[conflict_held("a", "b")]).unwrap();
            assert_eq!(desired, current);
        }

        #[test]
        fn resolved_agent_conditions_are_dropped() {
            let current = json!({
                "phase": "Ready",
                "conditions": [serde_json::to_value(conflict_held("a", "b")).unwrap()]
            });
            let d = json!({"phase": "Ready"});
            let desired = desired_upstream_status(Some(&d), Some(&current), &[]).unwrap();
            assert_eq!(desired, json!({"phase": "Ready"}));
        }

        #[test]
        fn agent_conditions_written_downstream_are_ignored() {
            let d = json!({"conditions": [{"type": "SyncConflict", "status": "True"}]});
            assert_eq!(desired_upstream_status(Some(&d), None, &[]), None);
        }
    }

    mod patches {
        use super::*;

        #[test]
        fn merge_patch_nulls_removed_keys() {
            let current = json!({"phase": "Pending", "old": 1, "nested": {"a": 1, "b": 2}});
            let desired = json!({"phase": "Ready", "nested": {"a": 1}});
            let patch = merge_patch(&current, &desired);
            assert_eq!(
                patch,
                json!({"phase": "Ready", "old": null, "nested": {"b": null}})
            );

            let mut applied = current.clone();
            apply_merge_patch(&mut applied, &patch);
            assert_eq!(applied, desired);
        }

        #[test]
        fn arrays_are_replaced_wholesale() {
            let mut target = json!({"conditions": [1, 2, 3]});
            apply_merge_patch(&mut target, &json!({"conditions": [4]}));
            assert_eq!(target, json!({"conditions": [4]}));
        }

        #[test]
        fn patching_a_missing_status_creates_it() {
            let mut target = Value::Null;
            apply_merge_patch(&mut target, &json!({"phase": "Ready"}));
            assert_eq!(target, json!({"phase": "Ready"}));
        }
    }
}
