//! Upstream finalizer handling and the deletion state machine
//!
//! The agent's finalizer is added to an upstream object before its downstream
//! mirror is created and removed only after a Get has confirmed the mirror is
//! gone. The deletion state is never stored; each pass derives it from what
//! it observes on both sides.

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::state::SyncState;

const FINALIZER_PREFIX: &str = "syncagent.kcp.io/";
const FINALIZER_NAME_PREFIX: &str = "cleanup-";

/// Longest agent name whose finalizer is still a valid qualified name
///
/// The part after the `/` is limited to 63 characters.
pub const MAX_AGENT_NAME_LEN: usize = 63 - FINALIZER_NAME_PREFIX.len();

/// Finalizer sentinel for an agent
pub fn finalizer_name(agent: &str) -> String {
    format!("{FINALIZER_PREFIX}{FINALIZER_NAME_PREFIX}{agent}")
}

/// True if the object carries the finalizer
pub fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Copy of the object with the finalizer added
pub fn with_finalizer(obj: &DynamicObject, finalizer: &str) -> DynamicObject {
    let mut obj = obj.clone();
    if !has_finalizer(&obj, finalizer) {
        obj.finalizers_mut().push(finalizer.to_string());
    }
    obj
}

/// Copy of the object with the finalizer removed
pub fn without_finalizer(obj: &DynamicObject, finalizer: &str) -> DynamicObject {
    let mut obj = obj.clone();
    obj.finalizers_mut().retain(|f| f != finalizer);
    obj
}

/// True if deletion has been requested on the object
pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Where an upstream object is in its deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionState {
    /// Not being deleted
    Active,
    /// Upstream marked for deletion, mirror untouched
    DeletionRequested,
    /// Delete issued against the mirror, not yet confirmed gone
    DownstreamDeleting,
    /// A Get confirmed the mirror is gone; the finalizer can be released
    DownstreamConfirmedGone,
    /// Our finalizer is gone from the upstream object (or the object is gone)
    FinalizerReleased,
}

impl std::fmt::Display for DeletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::DeletionRequested => write!(f, "DeletionRequested"),
            Self::DownstreamDeleting => write!(f, "DownstreamDeleting"),
            Self::DownstreamConfirmedGone => write!(f, "DownstreamConfirmedGone"),
            Self::FinalizerReleased => write!(f, "FinalizerReleased"),
        }
    }
}

/// Derive the deletion state from fetched objects
///
/// `downstream` must come from a Get issued in the same pass: its absence is
/// the not-found confirmation.
pub fn deletion_state(
    upstream: Option<&DynamicObject>,
    downstream: Option<&DynamicObject>,
    finalizer: &str,
) -> DeletionState {
    let Some(upstream) = upstream else {
        return DeletionState::FinalizerReleased;
    };
    if !is_deleting(upstream) {
        return DeletionState::Active;
    }
    if !has_finalizer(upstream, finalizer) {
        return DeletionState::FinalizerReleased;
    }
    match downstream {
        None => DeletionState::DownstreamConfirmedGone,
        Some(d) if is_deleting(d) || SyncState::from_object(d).deletion_in_progress => {
            DeletionState::DownstreamDeleting
        }
        Some(_) => DeletionState::DeletionRequested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{mark_deleting, testing::thing_obj};
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    const FIN: &str = "syncagent.kcp.io/cleanup-agent";

    fn deleting(obj: DynamicObject) -> DynamicObject {
        let mut obj = obj;
        obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        obj
    }

    #[test]
    fn finalizer_edits_are_idempotent() {
        let u = thing_obj("a", json!({}), "1");
        assert_eq!(finalizer_name("agent"), FIN);
        let with = with_finalizer(&with_finalizer(&u, FIN), FIN);
        assert_eq!(with.finalizers(), &[FIN.to_string()]);
        assert!(!has_finalizer(&without_finalizer(&with, FIN), FIN));
    }

    /// Story: the state machine walks forward only on observed facts
    #[test]
    fn story_deletion_walks_through_every_state() {
        let u = with_finalizer(&thing_obj("a", json!({}), "1"), FIN);
        let d = thing_obj("wabc-a", json!({}), "5");

        assert_eq!(deletion_state(Some(&u), Some(&d), FIN), DeletionState::Active);

        let u_del = deleting(u.clone());
        assert_eq!(
            deletion_state(Some(&u_del), Some(&d), FIN),
            DeletionState::DeletionRequested
        );
        assert_eq!(
            deletion_state(Some(&u_del), Some(&mark_deleting(&d, chrono::Utc::now())), FIN),
            DeletionState::DownstreamDeleting
        );
        assert_eq!(
            deletion_state(Some(&u_del), Some(&deleting(d.clone())), FIN),
            DeletionState::DownstreamDeleting
        );
        assert_eq!(
            deletion_state(Some(&u_del), None, FIN),
            DeletionState::DownstreamConfirmedGone
        );
        assert_eq!(
            deletion_state(Some(&without_finalizer(&u_del, FIN)), None, FIN),
            DeletionState::FinalizerReleased
        );
        assert_eq!(deletion_state(None, None, FIN), DeletionState::FinalizerReleased);
    }

    #[test]
    fn foreign_finalizers_are_untouched() {
        let mut u = thing_obj("a", json!({}), "1");
        u.finalizers_mut().push("other/keep".to_string());
        let u = without_finalizer(&with_finalizer(&u, FIN), FIN);
        assert_eq!(u.finalizers(), &["other/keep".to_string()]);
    }
}
