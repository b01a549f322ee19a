//! Deduplicating work queue
//!
//! The queue is a set: a key is pending at most once no matter how many
//! events arrive for it. A key handed to a worker is "processing" until
//! [`WorkQueue::done`]; adds for it in the meantime mark it dirty and it is
//! re-queued on completion. Together this guarantees at most one in-flight
//! reconciliation per key while never dropping an event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use syncagent_common::metrics;
use syncagent_common::retry::RetryConfig;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a key was queued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// An upstream watch event or relist difference
    UpstreamChanged,
    /// A downstream watch event or relist difference
    DownstreamChanged,
    /// A retry or delayed re-check scheduled by a worker
    Requeue,
    /// The periodic full resync
    PeriodicResync,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamChanged => write!(f, "UpstreamChanged"),
            Self::DownstreamChanged => write!(f, "DownstreamChanged"),
            Self::Requeue => write!(f, "Requeue"),
            Self::PeriodicResync => write!(f, "PeriodicResync"),
        }
    }
}

/// A key handed to a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem<K> {
    /// Object key
    pub key: K,
    /// Most recent reason the key was queued
    pub reason: Reason,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashMap<K, Reason>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Set-semantics work queue with per-key rate limiting
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    failures: DashMap<K, u32>,
    backoff: RetryConfig,
    shutdown: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited requeues follow `backoff`
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            failures: DashMap::new(),
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a key; a key already pending is not queued twice
    pub fn add(&self, key: K, reason: Reason) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if let Some(pending) = state.dirty.get_mut(&key) {
            *pending = reason;
            return;
        }
        state.dirty.insert(key.clone(), reason);
        if state.processing.contains(&key) {
            trace!(key = ?key, "key in flight, marked dirty");
            return;
        }
        state.queue.push_back(key);
        metrics::set_queue_depth(state.queue.len());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a key after a delay
    pub fn add_after(self: &std::sync::Arc<Self>, key: K, reason: Reason, delay: Duration) {
        if delay.is_zero() {
            self.add(key, reason);
            return;
        }
        let queue = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key, reason),
            }
        });
    }

    /// Queue a key after its per-key backoff; returns the delay used
    ///
    /// Each call for the same key doubles the delay up to the configured cap.
    /// There is no attempt limit.
    pub fn add_rate_limited(self: &std::sync::Arc<Self>, key: K, reason: Reason) -> Duration {
        let attempt = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = self.backoff.jittered_delay_for_attempt(attempt);
        self.add_after(key, reason, delay);
        delay
    }

    /// Reset the backoff for a key
    pub fn forget(&self, key: &K) {
        self.failures.remove(key);
    }

    /// Number of consecutive rate-limited requeues for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).map(|n| *n).unwrap_or(0)
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue shuts down or `cancel` fires. Keys still
    /// pending at that point are abandoned.
    pub async fn get(&self, cancel: &CancellationToken) -> Option<WorkItem<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down || cancel.is_cancelled() {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    let reason = state.dirty.remove(&key).unwrap_or(Reason::Requeue);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(state.queue.len());
                    return Some(WorkItem { key, reason });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Mark a key's processing finished, re-queueing it if it went dirty
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains_key(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            metrics::set_queue_depth(state.queue.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and cancel pending delayed adds
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// True once [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}
