//! List-then-watch producers feeding the work queue
//!
//! A watcher lists the collection, diffs it against the objects it already
//! knows, then watches from the list's resource version. A watch that ends
//! cleanly is resumed from the newest version it delivered. Any error triggers
//! a fresh list, so events missed while disconnected are recovered from the
//! diff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::ResourceExt;
use syncagent_common::retry::RetryConfig;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{DownstreamKey, IdentityMapper, UpstreamKey};
use crate::queue::{Reason, WorkQueue};
use crate::state::{is_managed_by, VersionTracker};
use crate::store::{ObjectStore, StoreEvent};

/// Which side a watcher observes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSource {
    /// One upstream workspace
    Upstream {
        /// Workspace path
        workspace: String,
    },
    /// The downstream cluster; only objects owned by this agent are followed
    Downstream,
}

/// A list-then-watch loop over one store
pub struct Watcher {
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<UpstreamKey>>,
    mapper: Arc<IdentityMapper>,
    tracker: Arc<VersionTracker>,
    source: WatchSource,
    gvr: String,
    resync_period: Option<Duration>,
    backoff: RetryConfig,
}

impl Watcher {
    /// Watcher for one upstream workspace
    pub fn upstream(
        workspace: &str,
        gvr: &str,
        store: Arc<dyn ObjectStore>,
        queue: Arc<WorkQueue<UpstreamKey>>,
        mapper: Arc<IdentityMapper>,
        tracker: Arc<VersionTracker>,
    ) -> Self {
        Self {
            store,
            queue,
            mapper,
            tracker,
            source: WatchSource::Upstream {
                workspace: workspace.to_string(),
            },
            gvr: gvr.to_string(),
            resync_period: None,
            backoff: RetryConfig::default(),
        }
    }

    /// Watcher for the downstream cluster
    pub fn downstream(
        gvr: &str,
        store: Arc<dyn ObjectStore>,
        queue: Arc<WorkQueue<UpstreamKey>>,
        mapper: Arc<IdentityMapper>,
        tracker: Arc<VersionTracker>,
    ) -> Self {
        Self {
            store,
            queue,
            mapper,
            tracker,
            source: WatchSource::Downstream,
            gvr: gvr.to_string(),
            resync_period: None,
            backoff: RetryConfig::default(),
        }
    }

    /// Re-queue every known key on this interval
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Backoff between failed list or watch attempts
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn reason(&self) -> Reason {
        match self.source {
            WatchSource::Upstream { .. } => Reason::UpstreamChanged,
            WatchSource::Downstream => Reason::DownstreamChanged,
        }
    }

    /// Upstream key an object maps to, `None` if it is not ours to follow
    fn key_for(&self, obj: &DynamicObject) -> Option<UpstreamKey> {
        match &self.source {
            WatchSource::Upstream { workspace } => {
                Some(UpstreamKey::for_object(workspace, &self.gvr, obj))
            }
            WatchSource::Downstream => {
                if !is_managed_by(obj, self.mapper.cluster()) {
                    return None;
                }
                let key = DownstreamKey::for_object(self.mapper.cluster(), obj);
                match self.mapper.to_upstream(&key) {
                    Ok(up) => Some(up),
                    Err(e) => {
                        warn!(object = %key, error = %e, "Ignoring downstream object with unmappable identity");
                        None
                    }
                }
            }
        }
    }

    /// True if the event carries a version the engine already acted on
    fn is_echo(&self, key: &UpstreamKey, obj: &DynamicObject) -> bool {
        match &self.source {
            WatchSource::Upstream { .. } => self.tracker.is_upstream_echo(key, obj),
            WatchSource::Downstream => {
                let down = DownstreamKey::for_object(self.mapper.cluster(), obj);
                self.tracker.is_downstream_echo(&down, obj)
            }
        }
    }

    /// Enqueue keys that appeared, changed or vanished since the last list
    fn diff(&self, known: &mut HashMap<UpstreamKey, String>, items: &[DynamicObject]) -> usize {
        let mut current = HashMap::with_capacity(items.len());
        let mut queued = 0;

        for obj in items {
            let Some(key) = self.key_for(obj) else {
                continue;
            };
            let rv = obj.resource_version().unwrap_or_default();
            if known.get(&key) != Some(&rv) && !self.is_echo(&key, obj) {
                self.queue.add(key.clone(), self.reason());
                queued += 1;
            }
            current.insert(key, rv);
        }

        for key in known.keys() {
            if !current.contains_key(key) {
                self.queue.add(key.clone(), self.reason());
                queued += 1;
            }
        }

        *known = current;
        queued
    }

    fn resync(&self, known: &HashMap<UpstreamKey, String>) {
        debug!(source = ?self.source, keys = known.len(), "Periodic resync");
        for key in known.keys() {
            self.queue.add(key.clone(), Reason::PeriodicResync);
        }
    }

    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let store = self.store.describe();
        info!(store = %store, source = ?self.source, "Starting watcher");

        let mut known: HashMap<UpstreamKey, String> = HashMap::new();
        let mut failures = 0u32;
        let mut ticker = self.resync_period.map(|period| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        'relist: loop {
            if failures > 0 {
                let delay = self.backoff.jittered_delay_for_attempt(failures);
                debug!(store = %store, attempt = failures, delay_ms = delay.as_millis() as u64, "Backing off before relist");
                tokio::select! {
                    _ = cancel.cancelled() => break 'relist,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let list = tokio::select! {
                _ = cancel.cancelled() => break 'relist,
                list = self.store.list() => list,
            };
            let list = match list {
                Ok(list) => list,
                Err(e) => {
                    failures += 1;
                    warn!(store = %store, error = %e, "List failed");
                    continue 'relist;
                }
            };
            let queued = self.diff(&mut known, &list.items);
            debug!(store = %store, objects = list.items.len(), queued, "Listed");

            // Resumed from the newest version seen; only errors force a relist
            let mut rv = list.resource_version.unwrap_or_default();
            'watch: loop {
                let mut stream = match self.store.watch(&rv).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        failures += 1;
                        warn!(store = %store, error = %e, "Watch failed");
                        continue 'relist;
                    }
                };
                failures = 0;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'relist,
                        _ = next_tick(&mut ticker) => self.resync(&known),
                        event = stream.next() => match event {
                            Some(Ok(StoreEvent::Added(obj))) | Some(Ok(StoreEvent::Modified(obj))) => {
                                advance(&mut rv, &obj);
                                let Some(key) = self.key_for(&obj) else { continue };
                                known.insert(key.clone(), obj.resource_version().unwrap_or_default());
                                if self.is_echo(&key, &obj) {
                                    debug!(object = %key, "Skipping echo of own write");
                                } else {
                                    self.queue.add(key, self.reason());
                                }
                            }
                            Some(Ok(StoreEvent::Deleted(obj))) => {
                                advance(&mut rv, &obj);
                                let Some(key) = self.key_for(&obj) else { continue };
                                known.remove(&key);
                                self.queue.add(key, self.reason());
                            }
                            Some(Ok(StoreEvent::Bookmark(version))) => {
                                if !version.is_empty() {
                                    rv = version;
                                }
                            }
                            Some(Err(e)) => {
                                failures += 1;
                                warn!(store = %store, error = %e, "Watch stream failed, relisting");
                                continue 'relist;
                            }
                            None => {
                                debug!(store = %store, resource_version = %rv, "Watch stream ended, resuming");
                                continue 'watch;
                            }
                        },
                    }
                }
            }
        }

        info!(store = %store, "Watcher stopped");
    }
}

fn advance(rv: &mut String, obj: &DynamicObject) {
    if let Some(version) = obj.resource_version() {
        *rv = version;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}
