//! Leader election using Kubernetes Leases
//!
//! Exactly one agent instance drives reconciliation for an upstream/downstream
//! pair at a time. Standbys wait on the lease and take over once it expires or
//! is released.
//!
//! # Atomicity
//!
//! [`KubeLeaseLock`] uses resourceVersion for compare-and-swap semantics. If
//! the lease changes between read and write, the update fails with 409
//! Conflict and the attempt counts as "not acquired".
//!
//! # Fencing
//!
//! Every acquisition yields a [`LeaseTerm`] whose `term` is the lease's
//! transition count. The [`Fence`] published by the elector carries the term
//! the instance currently leads under; work started under an older term must
//! not write. A leader that cannot renew within the renew deadline demotes its
//! fence before the lease can expire, so it stops writing before a peer can
//! acquire.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

// Timing defaults
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_DEADLINE: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease object is malformed
    #[error("invalid lease {name}: {message}")]
    InvalidLease {
        /// Lease name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// Election was abandoned because shutdown was requested
    #[error("leader election cancelled")]
    Cancelled,
}

/// Fencing token for one tenure of leadership
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseTerm {
    /// Identity of the holder
    pub identity: String,
    /// Monotonic term number (lease transitions)
    pub term: u64,
}

/// Timing for leader election
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// A leader that has not renewed within this window steps down
    pub renew_deadline: Duration,
    /// Interval between acquire attempts and renewals
    pub retry_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }
}

/// Capability over an external lease primitive
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to take (or keep) the lease. Returns the term when held.
    async fn acquire(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseTerm>, LeaderElectionError>;

    /// Extend a held lease. Returns false if the term is no longer held.
    async fn renew(
        &self,
        term: &LeaseTerm,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError>;

    /// Give the lease up so a standby can acquire immediately
    async fn release(&self, term: &LeaseTerm) -> Result<(), LeaderElectionError>;
}

// =============================================================================
// Fence
// =============================================================================

#[derive(Debug)]
struct FenceState {
    identity: String,
    term: AtomicU64,
    leader: AtomicBool,
}

/// Shared view of whether this instance currently leads, and under which term
#[derive(Clone, Debug)]
pub struct Fence {
    inner: Arc<FenceState>,
}

impl Fence {
    /// A fence that starts in standby
    pub fn standby(identity: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FenceState {
                identity: identity.into(),
                term: AtomicU64::new(0),
                leader: AtomicBool::new(false),
            }),
        }
    }

    /// A fence that leads forever under term 1 (leader election disabled)
    pub fn always_leader(identity: impl Into<String>) -> Self {
        let fence = Self::standby(identity);
        fence.promote(1);
        fence
    }

    /// Identity of this instance
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// The current term if this instance leads
    pub fn current(&self) -> Option<u64> {
        if self.inner.leader.load(Ordering::SeqCst) {
            Some(self.inner.term.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// True while leading under `term`
    pub fn holds(&self, term: u64) -> bool {
        self.current() == Some(term)
    }

    /// Fail with `LeadershipLost` unless still leading under `term`
    pub fn check(&self, term: u64) -> Result<(), crate::Error> {
        if self.holds(term) {
            Ok(())
        } else {
            Err(crate::Error::LeadershipLost {
                identity: self.inner.identity.clone(),
                term,
            })
        }
    }

    fn promote(&self, term: u64) {
        self.inner.term.store(term, Ordering::SeqCst);
        self.inner.leader.store(true, Ordering::SeqCst);
    }

    fn demote(&self) {
        self.inner.leader.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Elector
// =============================================================================

/// Leader elector over an injected [`LeaseLock`]
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    config: ElectionConfig,
    fence: Fence,
}

impl LeaderElector {
    /// Create a new leader elector
    pub fn new(lock: Arc<dyn LeaseLock>, identity: &str, config: ElectionConfig) -> Self {
        Self {
            lock,
            identity: identity.to_string(),
            config,
            fence: Fence::standby(identity),
        }
    }

    /// The fence this elector promotes and demotes
    pub fn fence(&self) -> Fence {
        self.fence.clone()
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease. When renewal fails past the renew
    /// deadline the fence is demoted and the guard's lost token fires.
    pub async fn acquire(
        self: Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<LeaderGuard, LeaderElectionError> {
        info!(identity = %self.identity, "Waiting for leadership...");

        loop {
            match self
                .lock
                .acquire(&self.identity, self.config.lease_duration)
                .await
            {
                Ok(Some(term)) => {
                    info!(identity = %self.identity, term = term.term, "Leadership acquired");
                    self.fence.promote(term.term);
                    metrics::set_leader(&self.identity, true);
                    return Ok(self.create_guard(term, cancel));
                }
                Ok(None) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LeaderElectionError::Cancelled),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>, term: LeaseTerm, parent: &CancellationToken) -> LeaderGuard {
        let lost = parent.child_token();
        let elector = Arc::clone(self);
        let renew_term = term.clone();
        let renew_lost = lost.clone();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(renew_term, renew_lost).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            term,
            renewal_task,
            lost,
        }
    }

    async fn renewal_loop(&self, term: LeaseTerm, lost: CancellationToken) {
        let mut last_renewed = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = lost.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let attempt = tokio::time::timeout(
                self.config.renew_deadline,
                self.lock.renew(&term, self.config.lease_duration),
            )
            .await;

            let still_leader = match attempt {
                Ok(Ok(true)) => {
                    last_renewed = tokio::time::Instant::now();
                    true
                }
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, term = term.term, "Lease taken over");
                    false
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                    last_renewed.elapsed() < self.config.renew_deadline
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal timed out");
                    last_renewed.elapsed() < self.config.renew_deadline
                }
            };

            if !still_leader {
                warn!(identity = %self.identity, term = term.term, "Leadership lost");
                // Demote FIRST so no new write starts under the stale term
                self.fence.demote();
                metrics::set_leader(&self.identity, false);
                lost.cancel();
                return;
            }
        }
    }
}

/// Guard that maintains leadership
///
/// While this guard exists the elector renews the lease. The renewal task is
/// aborted and the fence demoted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    term: LeaseTerm,
    renewal_task: JoinHandle<()>,
    lost: CancellationToken,
}

impl LeaderGuard {
    /// The fencing term this guard leads under
    pub fn term(&self) -> u64 {
        self.term.term
    }

    /// Token that fires when leadership is lost (or shutdown is requested)
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Wait until leadership is lost
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    /// Release leadership so a standby can take over immediately
    ///
    /// Call during graceful shutdown after in-flight work has drained.
    pub async fn release(self) -> Result<(), LeaderElectionError> {
        self.elector.fence.demote();
        self.lost.cancel();
        self.elector.lock.release(&self.term).await?;
        info!(identity = %self.term.identity, term = self.term.term, "Lease released for fast failover");
        Ok(())
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.fence.demote();
        metrics::set_leader(&self.elector.identity, false);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

// =============================================================================
// Kubernetes Lease backend
// =============================================================================

/// [`LeaseLock`] backed by a `coordination.k8s.io/v1` Lease
pub struct KubeLeaseLock {
    client: Client,
    namespace: String,
    lease_name: String,
}

impl KubeLeaseLock {
    /// Create a lock on the named lease
    pub fn new(client: Client, namespace: &str, lease_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            lease_name: lease_name.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn build_lease(
        &self,
        identity: &str,
        lease_duration: Duration,
        transitions: i32,
        resource_version: Option<String>,
    ) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Replace the lease, treating 409 as losing the race
    async fn replace_cas(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self
            .api()
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::InvalidLease {
                name: self.lease_name.clone(),
                message: "missing resourceVersion".to_string(),
            })
    }
}

fn lease_transitions(lease: &Lease) -> i32 {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.lease_transitions)
        .unwrap_or(0)
}

fn lease_holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
}

fn lease_expired(lease: &Lease, now: chrono::DateTime<Utc>) -> bool {
    let spec = lease.spec.as_ref();
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn acquire(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseTerm>, LeaderElectionError> {
        let api = self.api();

        let Some(existing) = api.get_opt(&self.lease_name).await? else {
            // No lease exists - create it (first leader)
            let lease = self.build_lease(identity, lease_duration, 0, None);
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(identity = %identity, "Created new lease");
                    Ok(Some(LeaseTerm {
                        identity: identity.to_string(),
                        term: 0,
                    }))
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!(identity = %identity, "Lease creation conflict, will retry");
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            };
        };

        let transitions = lease_transitions(&existing);
        let rv = self.resource_version(&existing)?;

        if lease_holder(&existing) == Some(identity) && !lease_expired(&existing, Utc::now()) {
            // Still ours (e.g. restart within the lease window): keep the term
            let mut renewed = existing.clone();
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(Utc::now()));
            }
            return Ok(self.replace_cas(&renewed).await?.then(|| LeaseTerm {
                identity: identity.to_string(),
                term: transitions as u64,
            }));
        }

        if lease_holder(&existing).is_some() && !lease_expired(&existing, Utc::now()) {
            return Ok(None);
        }

        let next = transitions + 1;
        let lease = self.build_lease(identity, lease_duration, next, Some(rv));
        if self.replace_cas(&lease).await? {
            info!(identity = %identity, transitions = next, "Took over expired lease");
            Ok(Some(LeaseTerm {
                identity: identity.to_string(),
                term: next as u64,
            }))
        } else {
            debug!(identity = %identity, "Lease takeover conflict, will retry");
            Ok(None)
        }
    }

    async fn renew(
        &self,
        term: &LeaseTerm,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let Some(existing) = self.api().get_opt(&self.lease_name).await? else {
            return Ok(false);
        };
        if lease_holder(&existing) != Some(term.identity.as_str())
            || lease_transitions(&existing) as u64 != term.term
        {
            return Ok(false);
        }

        let mut updated = existing.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(lease_duration.as_secs() as i32);
        }
        let renewed = self.replace_cas(&updated).await?;
        if renewed {
            debug!(identity = %term.identity, "Lease renewed");
        }
        Ok(renewed)
    }

    async fn release(&self, term: &LeaseTerm) -> Result<(), LeaderElectionError> {
        let Some(existing) = self.api().get_opt(&self.lease_name).await? else {
            debug!(identity = %term.identity, "Lease not found, nothing to release");
            return Ok(());
        };
        if lease_holder(&existing) != Some(term.identity.as_str())
            || lease_transitions(&existing) as u64 != term.term
        {
            debug!(identity = %term.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and backdate renew_time so it's immediately acquirable
        let mut released = existing.clone();
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        self.replace_cas(&released).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug, Default)]
struct MemoryLease {
    holder: Option<String>,
    term: u64,
    expires_at: Option<tokio::time::Instant>,
}

/// Process-local [`LeaseLock`], shared between electors to simulate peers
#[derive(Debug, Default, Clone)]
pub struct MemoryLeaseLock {
    lease: Arc<Mutex<MemoryLease>>,
}

impl MemoryLeaseLock {
    /// Create an unheld lease
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if the lease is held and unexpired
    pub fn holder(&self) -> Option<String> {
        let lease = self.lock();
        let now = tokio::time::Instant::now();
        match (&lease.holder, lease.expires_at) {
            (Some(h), Some(exp)) if exp > now => Some(h.clone()),
            _ => None,
        }
    }

    /// Force the lease to a new holder, bumping the term (simulates a peer)
    pub fn steal(&self, identity: &str, lease_duration: Duration) -> u64 {
        let mut lease = self.lock();
        lease.term += 1;
        lease.holder = Some(identity.to_string());
        lease.expires_at = Some(tokio::time::Instant::now() + lease_duration);
        lease.term
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLease> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn acquire(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseTerm>, LeaderElectionError> {
        let mut lease = self.lock();
        let now = tokio::time::Instant::now();
        let expired = lease.expires_at.map_or(true, |exp| exp <= now);

        if lease.holder.as_deref() == Some(identity) && !expired {
            lease.expires_at = Some(now + lease_duration);
        } else if lease.holder.is_none() || expired {
            lease.term += 1;
            lease.holder = Some(identity.to_string());
            lease.expires_at = Some(now + lease_duration);
        } else {
            return Ok(None);
        }

        Ok(Some(LeaseTerm {
            identity: identity.to_string(),
            term: lease.term,
        }))
    }

    async fn renew(
        &self,
        term: &LeaseTerm,
        lease_duration: Duration,
    ) -> Result<bool, LeaderElectionError> {
        let mut lease = self.lock();
        let now = tokio::time::Instant::now();
        let ours = lease.holder.as_deref() == Some(term.identity.as_str()) && lease.term == term.term;
        if !ours || lease.expires_at.map_or(true, |exp| exp <= now) {
            return Ok(false);
        }
        lease.expires_at = Some(now + lease_duration);
        Ok(true)
    }

    async fn release(&self, term: &LeaseTerm) -> Result<(), LeaderElectionError> {
        let mut lease = self.lock();
        if lease.holder.as_deref() == Some(term.identity.as_str()) && lease.term == term.term {
            lease.holder = None;
            lease.expires_at = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    fn elector(lock: &MemoryLeaseLock, identity: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(
            Arc::new(lock.clone()),
            identity,
            fast_config(),
        ))
    }

    #[test]
    fn fence_tracks_term() {
        let fence = Fence::standby("agent-0");
        assert_eq!(fence.current(), None);
        assert!(fence.check(1).is_err());

        fence.promote(4);
        assert!(fence.holds(4));
        assert!(!fence.holds(3));
        assert!(fence.check(4).is_ok());

        fence.demote();
        assert!(matches!(
            fence.check(4),
            Err(crate::Error::LeadershipLost { term: 4, .. })
        ));
    }

    #[test]
    fn always_leader_fence_uses_term_one() {
        let fence = Fence::always_leader("agent-0");
        assert_eq!(fence.current(), Some(1));
        assert_eq!(fence.identity(), "agent-0");
    }

    /// Story: a single instance becomes leader and keeps renewing
    #[tokio::test(start_paused = true)]
    async fn story_single_instance_leads_and_renews() {
        let lock = MemoryLeaseLock::new();
        let cancel = CancellationToken::new();
        let guard = elector(&lock, "a").acquire(&cancel).await.unwrap();
        assert_eq!(guard.term(), 1);

        // Well past the lease duration: renewal kept it alive
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lock.holder().as_deref(), Some("a"));
        assert!(!guard.lost_token().is_cancelled());
    }

    /// Story: a standby takes over after the leader releases, with a new term
    #[tokio::test(start_paused = true)]
    async fn story_standby_takes_over_after_release() {
        let lock = MemoryLeaseLock::new();
        let cancel = CancellationToken::new();

        let leader = elector(&lock, "a");
        let leader_fence = leader.fence();
        let guard = leader.acquire(&cancel).await.unwrap();

        let standby = elector(&lock, "b");
        let standby_fence = standby.fence();
        let standby_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { standby.acquire(&cancel).await.map(|g| g.term()) }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(standby_fence.current(), None);

        guard.release().await.unwrap();
        assert_eq!(leader_fence.current(), None);

        let term = standby_task.await.unwrap().unwrap();
        assert_eq!(term, 2);
    }

    /// Story: the lease is taken over behind the leader's back; the leader
    /// demotes its fence before signalling loss
    #[tokio::test(start_paused = true)]
    async fn story_lost_lease_demotes_fence() {
        let lock = MemoryLeaseLock::new();
        let cancel = CancellationToken::new();
        let leader = elector(&lock, "a");
        let fence = leader.fence();
        let guard = leader.acquire(&cancel).await.unwrap();
        let term = guard.term();

        lock.steal("b", Duration::from_secs(15));
        guard.lost().await;

        assert!(fence.check(term).is_err());
        assert_eq!(lock.holder().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_observes_cancellation() {
        let lock = MemoryLeaseLock::new();
        lock.steal("other", Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            let e = elector(&lock, "a");
            async move { e.acquire(&cancel).await.map(|g| g.term()) }
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(LeaderElectionError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_lock_expiry_allows_takeover() {
        let lock = MemoryLeaseLock::new();
        let a = lock.acquire("a", Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(lock.acquire("b", Duration::from_secs(10)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!lock.renew(&a, Duration::from_secs(10)).await.unwrap());
        let b = lock.acquire("b", Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(b.term, a.term + 1);
    }
}
