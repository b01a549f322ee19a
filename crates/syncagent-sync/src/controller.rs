//! Engine wiring: watchers produce keys, a bounded worker pool reconciles them
//!
//! One [`Engine`] runs per synchronized resource type. Watchers and workers
//! share nothing but the work queue, the echo tracker and the fence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use syncagent_common::leader_election::Fence;
use syncagent_common::metrics::{self, ReconcileResult, ReconcileTimer};
use syncagent_common::retry::RetryConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::conflict::SpecDriftPolicy;
use crate::identity::{IdentityMapper, UpstreamKey};
use crate::queue::{Reason, WorkQueue};
use crate::reconciler::{Outcome, Reconciler, ReconcilerConfig};
use crate::resource::ResourceType;
use crate::state::VersionTracker;
use crate::store::ObjectStore;
use crate::watcher::Watcher;

/// Something that can reconcile a key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Run one reconciliation for `key`
    async fn reconcile(&self, key: &UpstreamKey, cancel: &CancellationToken) -> Outcome;
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &UpstreamKey, cancel: &CancellationToken) -> Outcome {
        Reconciler::reconcile(self, key, cancel).await
    }
}

/// Engine tuning shared by every binding
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Full resync interval; zero disables it
    pub resync_period: Duration,
    /// How downstream-only spec edits are handled
    pub policy: SpecDriftPolicy,
    /// Upper bound for per-key retry backoff
    pub max_backoff: Duration,
    /// Delay before re-checking a held conflict
    pub conflict_recheck: Duration,
    /// Time a downstream deletion may take before it is reported as blocked
    pub deletion_blocked_after: Duration,
    /// Backoff between failed list or watch attempts
    pub relist_backoff: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(600),
            policy: SpecDriftPolicy::default(),
            max_backoff: Duration::from_secs(300),
            conflict_recheck: Duration::from_secs(60),
            deletion_blocked_after: Duration::from_secs(300),
            relist_backoff: RetryConfig::capped_at(Duration::from_secs(30)),
        }
    }
}

impl EngineConfig {
    /// Reconciler settings for an agent
    pub fn reconciler_config(&self, agent_name: &str) -> ReconcilerConfig {
        ReconcilerConfig {
            policy: self.policy,
            conflict_recheck: self.conflict_recheck,
            deletion_blocked_after: self.deletion_blocked_after,
            ..ReconcilerConfig::new(agent_name)
        }
    }

    fn queue_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: self.max_backoff,
            backoff_multiplier: 2.0,
        }
    }
}

/// Watchers, queue and workers for one resource type
pub struct Engine {
    reconciler: Arc<Reconciler>,
    upstreams: HashMap<String, Arc<dyn ObjectStore>>,
    downstream: Arc<dyn ObjectStore>,
    mapper: Arc<IdentityMapper>,
    tracker: Arc<VersionTracker>,
    queue: Arc<WorkQueue<UpstreamKey>>,
    config: EngineConfig,
}

impl Engine {
    /// Assemble an engine
    ///
    /// `upstreams` maps each workspace path to its store; `mapper` must know
    /// the same workspaces.
    pub fn new(
        resource: ResourceType,
        upstreams: HashMap<String, Arc<dyn ObjectStore>>,
        downstream: Arc<dyn ObjectStore>,
        mapper: Arc<IdentityMapper>,
        fence: Fence,
        agent_name: &str,
        config: EngineConfig,
    ) -> Self {
        let tracker = Arc::new(VersionTracker::new());
        let reconciler = Arc::new(Reconciler::new(
            resource,
            upstreams.clone(),
            downstream.clone(),
            mapper.clone(),
            tracker.clone(),
            fence,
            config.reconciler_config(agent_name),
        ));
        let queue = Arc::new(WorkQueue::new(config.queue_backoff()));
        Self {
            reconciler,
            upstreams,
            downstream,
            mapper,
            tracker,
            queue,
            config,
        }
    }

    /// The engine's work queue
    pub fn queue(&self) -> &Arc<WorkQueue<UpstreamKey>> {
        &self.queue
    }

    /// The engine's reconciler
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run watchers and workers until `cancel` fires
    ///
    /// Returns once every worker has finished its current item and every
    /// watcher has stopped. Keys still queued are abandoned; they are
    /// rediscovered by the initial list on the next start.
    pub async fn run(self, cancel: CancellationToken) {
        let resource = self.reconciler.resource().clone();
        let gvr = resource.gvr();
        info!(
            resource = %resource,
            workspaces = self.upstreams.len(),
            workers = self.config.workers,
            "Starting sync engine"
        );

        let mut watchers = JoinSet::new();
        for (workspace, store) in &self.upstreams {
            let watcher = Watcher::upstream(
                workspace,
                &gvr,
                store.clone(),
                self.queue.clone(),
                self.mapper.clone(),
                self.tracker.clone(),
            )
            .with_resync(self.config.resync_period)
            .with_backoff(self.config.relist_backoff.clone());
            watchers.spawn(watcher.run(cancel.clone()));
        }
        let downstream = Watcher::downstream(
            &gvr,
            self.downstream.clone(),
            self.queue.clone(),
            self.mapper.clone(),
            self.tracker.clone(),
        )
        .with_backoff(self.config.relist_backoff.clone());
        watchers.spawn(downstream.run(cancel.clone()));

        run_workers(
            self.reconciler.clone(),
            self.queue.clone(),
            self.config.workers,
            cancel.clone(),
        )
        .await;

        self.queue.shutdown();
        while let Some(joined) = watchers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Watcher task failed");
            }
        }
        info!(resource = %resource, "Sync engine stopped");
    }
}

/// Drain `queue` with `workers` concurrent workers until `cancel` fires
pub async fn run_workers<R: Reconcile>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<UpstreamKey>>,
    workers: usize,
    cancel: CancellationToken,
) {
    let mut pool = JoinSet::new();
    for id in 0..workers.max(1) {
        pool.spawn(worker(id, reconciler.clone(), queue.clone(), cancel.clone()));
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task failed");
        }
    }
}

async fn worker<R: Reconcile>(
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<UpstreamKey>>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    while let Some(item) = queue.get(&cancel).await {
        let key = item.key;
        let timer = ReconcileTimer::start();
        debug!(worker = id, object = %key, reason = %item.reason, "Reconciling");

        match reconciler.reconcile(&key, &cancel).await {
            Outcome::Done(decision) => {
                metrics::record_decision(decision.as_str());
                queue.forget(&key);
                timer.finish(ReconcileResult::Success);
            }
            Outcome::RequeueAfter(decision, delay) => {
                metrics::record_decision(decision.as_str());
                queue.forget(&key);
                queue.add_after(key.clone(), Reason::Requeue, delay);
                timer.finish(ReconcileResult::Success);
            }
            Outcome::Backoff(decision) => {
                metrics::record_decision(decision.as_str());
                let delay = queue.add_rate_limited(key.clone(), Reason::Requeue);
                debug!(object = %key, delay_ms = delay.as_millis() as u64, "Waiting");
                timer.finish(ReconcileResult::Success);
            }
            Outcome::AwaitChange => {
                queue.forget(&key);
                timer.finish(ReconcileResult::Success);
            }
            Outcome::Retry(e) => {
                metrics::record_error(e.class());
                let delay = queue.add_rate_limited(key.clone(), Reason::Requeue);
                warn!(
                    object = %key,
                    error = %e,
                    attempt = queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "Reconcile failed, retrying"
                );
                timer.finish(ReconcileResult::Error);
            }
            Outcome::Cancelled => {
                timer.finish(ReconcileResult::Cancelled);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ObjectName;
    use crate::reconciler::SyncDecision;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use syncagent_common::Error;

    fn key(name: &str) -> UpstreamKey {
        UpstreamKey {
            workspace: "root:org".to_string(),
            gvr: "dummy.kcp.io/v1alpha1/things".to_string(),
            object: ObjectName::cluster(name),
        }
    }

    fn queue() -> Arc<WorkQueue<UpstreamKey>> {
        Arc::new(WorkQueue::new(EngineConfig::default().queue_backoff()))
    }

    async fn wait_idle(queue: &WorkQueue<UpstreamKey>) {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if queue.is_empty() && queue.in_flight() == 0 {
                return;
            }
        }
    }

    /// Counts overlapping calls and remembers the newest version it observed
    struct Recorder {
        version: Arc<AtomicU64>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        last_seen: AtomicU64,
    }

    #[async_trait]
    impl Reconcile for Recorder {
        async fn reconcile(&self, _key: &UpstreamKey, _cancel: &CancellationToken) -> Outcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_seen
                .store(self.version.load(Ordering::SeqCst), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Outcome::Done(SyncDecision::UpdateSpec)
        }
    }

    /// Story: a burst of events for one object never runs two passes at once,
    /// and the last pass sees the last change
    #[tokio::test(start_paused = true)]
    async fn story_hundred_events_one_reconcile_at_a_time() {
        let version = Arc::new(AtomicU64::new(0));
        let recorder = Arc::new(Recorder {
            version: version.clone(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            last_seen: AtomicU64::new(0),
        });
        let q = queue();
        let cancel = CancellationToken::new();
        let pool = tokio::spawn(run_workers(recorder.clone(), q.clone(), 8, cancel.clone()));

        let mut producers = JoinSet::new();
        for i in 1..=100u64 {
            let q = q.clone();
            let version = version.clone();
            producers.spawn(async move {
                tokio::time::sleep(Duration::from_millis(i % 7)).await;
                version.fetch_max(i, Ordering::SeqCst);
                q.add(key("a"), Reason::UpstreamChanged);
            });
        }
        while producers.join_next().await.is_some() {}
        wait_idle(&q).await;

        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        assert!(recorder.calls.load(Ordering::SeqCst) <= 100);
        assert_eq!(recorder.last_seen.load(Ordering::SeqCst), 100);

        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_in_parallel() {
        let recorder = Arc::new(Recorder {
            version: Arc::new(AtomicU64::new(0)),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            last_seen: AtomicU64::new(0),
        });
        let q = queue();
        let cancel = CancellationToken::new();
        for name in ["a", "b", "c", "d"] {
            q.add(key(name), Reason::UpstreamChanged);
        }
        let pool = tokio::spawn(run_workers(recorder.clone(), q.clone(), 4, cancel.clone()));
        wait_idle(&q).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 4);
        assert!(recorder.max_active.load(Ordering::SeqCst) > 1);
        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pass_is_retried_with_backoff_then_forgotten() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockReconcile::new();
        let counter = calls.clone();
        mock.expect_reconcile().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Outcome::Retry(Error::internal("boom"))
            } else {
                Outcome::Done(SyncDecision::NoOp)
            }
        });

        let q = queue();
        let cancel = CancellationToken::new();
        q.add(key("a"), Reason::UpstreamChanged);
        let pool = tokio::spawn(run_workers(Arc::new(mock), q.clone(), 2, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.num_requeues(&key("a")), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(q.num_requeues(&key("a")), 0);

        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn await_change_is_not_requeued() {
        let mut mock = MockReconcile::new();
        mock.expect_reconcile()
            .times(1)
            .returning(|_, _| Outcome::AwaitChange);

        let q = queue();
        let cancel = CancellationToken::new();
        q.add(key("a"), Reason::UpstreamChanged);
        let pool = tokio::spawn(run_workers(Arc::new(mock), q.clone(), 1, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(q.is_empty());
        cancel.cancel();
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn workers_exit_on_cancel() {
        let mut mock = MockReconcile::new();
        mock.expect_reconcile().never();
        let cancel = CancellationToken::new();
        let pool = tokio::spawn(run_workers(Arc::new(mock), queue(), 4, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), pool)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn engine_config_feeds_reconciler() {
        let config = EngineConfig {
            policy: SpecDriftPolicy::PreserveDownstream,
            ..Default::default()
        };
        let rc = config.reconciler_config("agent");
        assert_eq!(rc.agent_name, "agent");
        assert_eq!(rc.policy, SpecDriftPolicy::PreserveDownstream);
        assert_eq!(rc.max_conflict_retries, 3);
    }
}
