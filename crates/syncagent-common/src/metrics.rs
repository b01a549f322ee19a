//! Metrics registry for sync agent observability
//!
//! OpenTelemetry instruments for:
//! - Reconcile passes (decision counts, duration, errors by class)
//! - Spec conflicts held for operator attention
//! - Work queue depth
//! - Leadership state

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::ErrorClass;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("syncagent"));

/// Counter of completed reconcile passes
///
/// Labels:
/// - `decision`: create, update_spec, update_status, noop, delete, conflict_hold
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("syncagent_reconcile_total")
        .with_description("Total number of reconcile passes by decision")
        .with_unit("{passes}")
        .build()
});

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `result`: success, error, cancelled
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("syncagent_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `class`: transient, validation, collision, cancelled, fatal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("syncagent_reconcile_errors_total")
        .with_description("Total number of reconcile errors by class")
        .with_unit("{errors}")
        .build()
});

/// Counter of passes that ended in a spec conflict hold
pub static SPEC_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("syncagent_spec_conflicts_total")
        .with_description("Total number of spec conflicts held without writing")
        .with_unit("{conflicts}")
        .build()
});

/// Gauge of keys waiting in the work queue
pub static WORKQUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("syncagent_workqueue_depth")
        .with_description("Number of keys waiting in the work queue")
        .with_unit("{keys}")
        .build()
});

/// Gauge of leadership state (1 leader, 0 standby)
///
/// Labels:
/// - `identity`: agent instance identity
pub static LEADER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("syncagent_leader")
        .with_description("Whether this instance holds the leader lease")
        .build()
});

/// Outcome label for reconcile duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// The pass finished (including held conflicts and paused objects)
    Success,
    /// The pass failed and will be retried
    Error,
    /// The pass was abandoned (shutdown or leadership loss)
    Cancelled,
}

impl ReconcileResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Timer for a single reconcile pass
///
/// Records duration on completion.
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the pass duration under the given result
    pub fn finish(self, result: ReconcileResult) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result.as_str())],
        );
    }
}

/// Count a completed pass by its decision label
pub fn record_decision(decision: &'static str) {
    RECONCILE_TOTAL.add(1, &[KeyValue::new("decision", decision)]);
}

/// Count a failed pass by error class
pub fn record_error(class: ErrorClass) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("class", class.to_string())]);
}

/// Count a held spec conflict
pub fn record_conflict() {
    SPEC_CONFLICTS.add(1, &[]);
}

/// Publish the current work queue depth
pub fn set_queue_depth(depth: usize) {
    WORKQUEUE_DEPTH.record(depth as i64, &[]);
}

/// Publish leadership state for an identity
pub fn set_leader(identity: &str, leader: bool) {
    LEADER.record(
        i64::from(leader),
        &[KeyValue::new("identity", identity.to_string())],
    );
}
