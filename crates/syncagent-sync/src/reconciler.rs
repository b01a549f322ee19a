//! Per-object reconciliation
//!
//! A pass fetches both sides, derives what has to change from observed state
//! alone, and performs at most the writes needed to converge. All bookkeeping
//! is written together with, or after, the write it describes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use syncagent_common::crd::Condition;
use syncagent_common::leader_election::Fence;
use syncagent_common::{metrics, Error, ErrorClass, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::conflict::{resolve_spec, SpecDriftPolicy, SpecResolution};
use crate::finalizer::{
    deletion_state, finalizer_name, has_finalizer, is_deleting, with_finalizer, without_finalizer,
    DeletionState,
};
use crate::identity::{IdentityMapper, UpstreamKey};
use crate::resource::ResourceType;
use crate::state::{
    apply_upstream_spec, is_managed_by, mark_deleting, project, record_synced, spec_hash,
    status_of, SyncState, TrackedObject, VersionTracker,
};
use crate::status::{
    conflict_held, deletion_blocked, desired_upstream_status, drift_preserved, merge_patch,
    validation_failed,
};
use crate::store::ObjectStore;

/// What a pass did, for logs and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    /// Nothing to write
    NoOp,
    /// The downstream mirror was created
    Create,
    /// The downstream spec or its sync bookkeeping was written
    UpdateSpec,
    /// Only the upstream status was written
    UpdateStatus,
    /// The downstream mirror is being or has been deleted
    Delete,
    /// Both sides changed; nothing was written to the spec
    ConflictHold,
}

impl SyncDecision {
    /// Stable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Create => "create",
            Self::UpdateSpec => "update_spec",
            Self::UpdateStatus => "update_status",
            Self::Delete => "delete",
            Self::ConflictHold => "conflict_hold",
        }
    }
}

impl std::fmt::Display for SyncDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a reconcile pass, consumed by the worker
#[derive(Debug)]
pub enum Outcome {
    /// Converged for now; reset backoff
    Done(SyncDecision),
    /// Check again after a fixed delay
    RequeueAfter(SyncDecision, Duration),
    /// Check again with growing per-key backoff, without reporting an error
    Backoff(SyncDecision),
    /// Paused until the object changes
    AwaitChange,
    /// Failed; requeue with backoff
    Retry(Error),
    /// Shutdown or leadership loss; drop the key quietly
    Cancelled,
}

/// Reconciler tuning
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Agent name: ownership label value and finalizer suffix
    pub agent_name: String,
    /// How downstream-only spec edits are handled
    pub policy: SpecDriftPolicy,
    /// Delay before re-checking a held conflict
    pub conflict_recheck: Duration,
    /// Time a downstream deletion may take before `DeletionBlocked` is reported
    pub deletion_blocked_after: Duration,
    /// Immediate retries on version conflicts within one pass
    pub max_conflict_retries: u32,
}

impl ReconcilerConfig {
    /// Defaults for the given agent
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            policy: SpecDriftPolicy::default(),
            conflict_recheck: Duration::from_secs(60),
            deletion_blocked_after: Duration::from_secs(300),
            max_conflict_retries: 3,
        }
    }
}

/// Sync engine for one resource type
pub struct Reconciler {
    resource: ResourceType,
    upstreams: HashMap<String, Arc<dyn ObjectStore>>,
    downstream: Arc<dyn ObjectStore>,
    mapper: Arc<IdentityMapper>,
    tracker: Arc<VersionTracker>,
    fence: Fence,
    config: ReconcilerConfig,
    finalizer: String,
}

impl Reconciler {
    /// Create a reconciler
    ///
    /// `upstreams` maps each workspace path to its store.
    pub fn new(
        resource: ResourceType,
        upstreams: HashMap<String, Arc<dyn ObjectStore>>,
        downstream: Arc<dyn ObjectStore>,
        mapper: Arc<IdentityMapper>,
        tracker: Arc<VersionTracker>,
        fence: Fence,
        config: ReconcilerConfig,
    ) -> Self {
        let finalizer = finalizer_name(&config.agent_name);
        Self {
            resource,
            upstreams,
            downstream,
            mapper,
            tracker,
            fence,
            config,
            finalizer,
        }
    }

    /// Resource type handled by this reconciler
    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    /// Echo tracker shared with the watchers
    pub fn tracker(&self) -> &Arc<VersionTracker> {
        &self.tracker
    }

    /// Reconcile one object until it converges, fails, or is cancelled
    #[instrument(skip(self, cancel), fields(object = %key))]
    pub async fn reconcile(&self, key: &UpstreamKey, cancel: &CancellationToken) -> Outcome {
        let Some(term) = self.fence.current() else {
            debug!("not leading, dropping key");
            return Outcome::Cancelled;
        };

        let mut conflicts = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                result = self.pass(key, term) => result,
            };

            match result {
                Ok(outcome) => return outcome,
                Err(e) if e.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(attempt = conflicts, error = %e, "version conflict, re-fetching");
                }
                Err(e) => {
                    return match e.class() {
                        ErrorClass::Cancelled => {
                            info!(error = %e, "pass abandoned");
                            Outcome::Cancelled
                        }
                        ErrorClass::Validation | ErrorClass::Collision => {
                            self.report_validation(key, term, &e).await
                        }
                        ErrorClass::Transient | ErrorClass::Fatal => Outcome::Retry(e),
                    };
                }
            }
        }
    }

    fn upstream(&self, key: &UpstreamKey) -> Result<&Arc<dyn ObjectStore>> {
        self.upstreams.get(&key.workspace).ok_or_else(|| {
            Error::validation_for(
                key.to_string(),
                format!("workspace {} has no upstream store", key.workspace),
            )
        })
    }

    async fn pass(&self, key: &UpstreamKey, term: u64) -> Result<Outcome> {
        let down_key = self.mapper.to_downstream(key)?;
        let upstream = self.upstream(key)?;

        let u = upstream.get(&key.object).await?;
        let d = self.downstream.get(&down_key.object).await?;
        if let Some(u) = &u {
            self.tracker.record_upstream(key, u);
        }
        if let Some(d) = &d {
            self.tracker.record_downstream(&down_key, d);
        }

        let tracked = TrackedObject {
            upstream: key.clone(),
            downstream: down_key.clone(),
            state: d.as_ref().map(SyncState::from_object).unwrap_or_default(),
            last_downstream_resource_version: self.tracker.last_downstream(&down_key),
        };

        let Some(u) = u else {
            return match d {
                Some(d) if tracked.state.is_owned_by(&self.config.agent_name) => {
                    self.delete_orphan(&tracked, &d, term).await
                }
                Some(_) => Ok(Outcome::Done(SyncDecision::NoOp)),
                None => {
                    self.tracker.forget(key, &down_key);
                    Ok(Outcome::Done(SyncDecision::NoOp))
                }
            };
        };

        if let Some(d) = &d {
            if !is_managed_by(d, &self.config.agent_name) {
                return Err(Error::validation_for(
                    key.to_string(),
                    format!(
                        "downstream object {} exists and is not managed by agent {}",
                        down_key, self.config.agent_name
                    ),
                ));
            }
        }

        let state = deletion_state(Some(&u), d.as_ref(), &self.finalizer);
        debug!(deletion_state = %state, has_downstream = d.is_some(), "fetched");
        match state {
            DeletionState::Active => self.sync(&tracked, u, d, term).await,
            DeletionState::DeletionRequested | DeletionState::DownstreamDeleting => {
                let Some(d) = d else {
                    return Err(Error::internal("downstream object vanished mid-pass"));
                };
                self.finalize(&tracked, &u, d, term).await
            }
            DeletionState::DownstreamConfirmedGone => self.release(&tracked, &u, term).await,
            // Deleting without our finalizer: nothing guards the mirror any more
            DeletionState::FinalizerReleased => match d {
                Some(d) => self.delete_orphan(&tracked, &d, term).await,
                None => Ok(Outcome::Done(SyncDecision::NoOp)),
            },
        }
    }

    async fn sync(
        &self,
        tracked: &TrackedObject,
        u: DynamicObject,
        d: Option<DynamicObject>,
        term: u64,
    ) -> Result<Outcome> {
        let upstream = self.upstream(&tracked.upstream)?;

        let u = if has_finalizer(&u, &self.finalizer) {
            u
        } else {
            self.fence.check(term)?;
            let updated = upstream.update(&with_finalizer(&u, &self.finalizer)).await?;
            self.tracker.record_upstream(&tracked.upstream, &updated);
            debug!("added finalizer");
            updated
        };

        let Some(d) = d else {
            return self.create(tracked, &u, term).await;
        };

        if is_deleting(&d) {
            debug!("downstream object is terminating, waiting for it to go");
            return Ok(Outcome::Done(SyncDecision::NoOp));
        }

        let upstream_hash = spec_hash(&u);
        let downstream_hash = spec_hash(&d);
        let resolution = resolve_spec(
            &upstream_hash,
            &downstream_hash,
            tracked.state.last_synced_spec_hash.as_deref(),
            self.config.policy,
        );

        let mut conditions: Vec<Condition> = Vec::new();
        let mut decision = SyncDecision::NoOp;
        let d = match resolution {
            SpecResolution::InSync => d,
            SpecResolution::ApplyUpstream(reason) => {
                self.fence.check(term)?;
                let written = self
                    .downstream
                    .update(&apply_upstream_spec(&d, &u, &tracked.upstream))
                    .await?;
                self.tracker.record_downstream(&tracked.downstream, &written);
                info!(reason = ?reason, hash = %upstream_hash, "applied upstream spec");
                decision = SyncDecision::UpdateSpec;
                written
            }
            SpecResolution::RecordOnly => {
                self.fence.check(term)?;
                let written = self
                    .downstream
                    .update(&record_synced(&d, &u, &tracked.upstream))
                    .await?;
                self.tracker.record_downstream(&tracked.downstream, &written);
                debug!(hash = %upstream_hash, "recorded converged spec");
                decision = SyncDecision::UpdateSpec;
                written
            }
            SpecResolution::KeepDownstream => {
                conditions.push(drift_preserved(&downstream_hash));
                d
            }
            SpecResolution::Hold => {
                warn!(
                    upstream_hash = %upstream_hash,
                    downstream_hash = %downstream_hash,
                    "spec changed on both sides, holding"
                );
                metrics::record_conflict();
                conditions.push(conflict_held(&upstream_hash, &downstream_hash));
                decision = SyncDecision::ConflictHold;
                d
            }
        };

        let base = status_of(&d).or_else(|| status_of(&u));
        if self
            .publish_status(&tracked.upstream, &u, base, &conditions, term)
            .await?
            && decision == SyncDecision::NoOp
        {
            decision = SyncDecision::UpdateStatus;
        }

        Ok(match decision {
            SyncDecision::ConflictHold => {
                Outcome::RequeueAfter(decision, self.config.conflict_recheck)
            }
            _ => Outcome::Done(decision),
        })
    }

    async fn create(
        &self,
        tracked: &TrackedObject,
        u: &DynamicObject,
        term: u64,
    ) -> Result<Outcome> {
        self.fence.check(term)?;
        if let Some(ns) = &tracked.downstream.object.namespace {
            self.downstream.ensure_namespace(ns).await?;
        }

        self.fence.check(term)?;
        let mirror = project(u, &tracked.upstream, &tracked.downstream, &self.config.agent_name);
        let created = self.downstream.create(&mirror).await?;
        self.tracker.record_downstream(&tracked.downstream, &created);
        info!(downstream = %tracked.downstream, hash = %spec_hash(u), "created downstream object");

        self.publish_status(&tracked.upstream, u, status_of(u), &[], term)
            .await?;
        Ok(Outcome::Done(SyncDecision::Create))
    }

    /// Start or follow the downstream deletion, then release when it is gone
    async fn finalize(
        &self,
        tracked: &TrackedObject,
        u: &DynamicObject,
        d: DynamicObject,
        term: u64,
    ) -> Result<Outcome> {
        let mut deleting_since = tracked.state.deleting_since;
        if !is_deleting(&d) {
            let d = if tracked.state.deletion_in_progress {
                d
            } else {
                self.fence.check(term)?;
                let marked = self.downstream.update(&mark_deleting(&d, Utc::now())).await?;
                self.tracker.record_downstream(&tracked.downstream, &marked);
                deleting_since = SyncState::from_object(&marked).deleting_since;
                marked
            };
            self.fence.check(term)?;
            self.downstream
                .delete(&tracked.downstream.object, d.resource_version())
                .await?;
            info!(downstream = %tracked.downstream, "deleting downstream object");
        }

        // Only a not-found from a fresh read confirms the deletion
        match self.downstream.get(&tracked.downstream.object).await? {
            None => self.release(tracked, u, term).await,
            Some(remaining) => {
                self.tracker.record_downstream(&tracked.downstream, &remaining);
                // Mirrors terminated by someone else carry no start time of ours
                let waited = deleting_since
                    .or_else(|| remaining.metadata.deletion_timestamp.as_ref().map(|ts| ts.0))
                    .and_then(|since| Utc::now().signed_duration_since(since).to_std().ok())
                    .unwrap_or_default();
                if waited >= self.config.deletion_blocked_after {
                    let waited_secs = waited.as_secs() as i64;
                    warn!(
                        downstream = %tracked.downstream,
                        waited_secs,
                        finalizers = ?remaining.finalizers(),
                        "downstream deletion is not completing"
                    );
                    let condition = deletion_blocked(&tracked.downstream.to_string(), waited_secs);
                    self.publish_status(&tracked.upstream, u, status_of(u), &[condition], term)
                        .await?;
                }
                Ok(Outcome::Backoff(SyncDecision::Delete))
            }
        }
    }

    /// Drop the upstream finalizer once the mirror is confirmed gone
    async fn release(
        &self,
        tracked: &TrackedObject,
        u: &DynamicObject,
        term: u64,
    ) -> Result<Outcome> {
        let upstream = self.upstream(&tracked.upstream)?;
        self.fence.check(term)?;
        upstream
            .update(&without_finalizer(u, &self.finalizer))
            .await?;
        self.tracker.forget(&tracked.upstream, &tracked.downstream);
        info!("downstream object gone, released finalizer");
        Ok(Outcome::Done(SyncDecision::Delete))
    }

    async fn delete_orphan(
        &self,
        tracked: &TrackedObject,
        d: &DynamicObject,
        term: u64,
    ) -> Result<Outcome> {
        if is_deleting(d) {
            return Ok(Outcome::Done(SyncDecision::NoOp));
        }
        self.fence.check(term)?;
        self.downstream
            .delete(&tracked.downstream.object, d.resource_version())
            .await?;
        info!(downstream = %tracked.downstream, "deleted orphaned downstream object");
        Ok(Outcome::Done(SyncDecision::Delete))
    }

    /// Patch the upstream status if it differs from what it should be
    ///
    /// Returns whether a write happened.
    async fn publish_status(
        &self,
        key: &UpstreamKey,
        u: &DynamicObject,
        base: Option<&Value>,
        conditions: &[Condition],
        term: u64,
    ) -> Result<bool> {
        if !self.resource.has_status {
            return Ok(false);
        }

        let current = status_of(u);
        let desired = desired_upstream_status(base, current, conditions);
        let unchanged = match (&desired, current) {
            (Some(want), Some(have)) => want == have,
            (None, Some(have)) => have.as_object().is_some_and(|m| m.is_empty()),
            (None, None) => true,
            (Some(_), None) => false,
        };
        if unchanged {
            return Ok(false);
        }

        let empty = Value::Object(Default::default());
        let patch = merge_patch(
            current.unwrap_or(&Value::Null),
            desired.as_ref().unwrap_or(&empty),
        );
        self.fence.check(term)?;
        let written = self
            .upstream(key)?
            .patch_status(
                &key.object,
                &u.resource_version().unwrap_or_default(),
                &patch,
            )
            .await?;
        self.tracker.record_upstream(key, &written);
        debug!("updated upstream status");
        Ok(true)
    }

    /// Put a `SyncValidation` condition on the upstream object and pause
    async fn report_validation(&self, key: &UpstreamKey, term: u64, err: &Error) -> Outcome {
        warn!(error = %err, "object cannot be synchronized");
        metrics::record_error(err.class());

        let result = async {
            let Some(u) = self.upstream(key)?.get(&key.object).await? else {
                return Ok(());
            };
            let condition = validation_failed(&err.to_string());
            self.publish_status(key, &u, status_of(&u), &[condition], term)
                .await
                .map(|_| ())
        }
        .await;

        match result {
            Ok(()) => Outcome::AwaitChange,
            Err(e) if e.class() == ErrorClass::Cancelled => Outcome::Cancelled,
            Err(e) if e.is_retryable() => Outcome::Retry(e),
            Err(e) => {
                warn!(error = %e, "could not report validation failure");
                Outcome::AwaitChange
            }
        }
    }
}
