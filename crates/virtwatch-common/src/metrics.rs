//! Metrics registry for virtwatch observability
//!
//! Provides OpenTelemetry metrics for:
//! - Node reconciliation (duration, errors)
//! - Schedulable label patches
//! - VM failure transitions
//! - Work queue retries

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for virtwatch metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("virtwatch"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of node reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static NODE_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("virtwatch_node_reconcile_duration_seconds")
        .with_description("Duration of node reconciliation cycles in seconds")
        .with_unit("s")
        .build()
});

/// Counter of node reconciliation errors
///
/// Labels:
/// - `error_type`: kube, conflict, not_found, partial_failure, ...
pub static NODE_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virtwatch_node_reconcile_errors_total")
        .with_description("Total number of failed node reconciliation cycles")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Mutation Metrics
// ============================================================================

/// Counter of schedulable label patches
///
/// Labels:
/// - `value`: true, false
/// - `result`: success, error
pub static SCHEDULABLE_PATCHES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virtwatch_schedulable_label_patches_total")
        .with_description("Total number of node schedulable label patches")
        .with_unit("{patches}")
        .build()
});

/// Counter of VM failure transitions
///
/// Labels:
/// - `result`: success, error
pub static VM_FAILURE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virtwatch_vm_failure_transitions_total")
        .with_description("Total number of VMs moved to Failed because their node went silent")
        .with_unit("{vms}")
        .build()
});

// ============================================================================
// Queue Metrics
// ============================================================================

/// Counter of keys re-enqueued after a failed cycle
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virtwatch_workqueue_retries_total")
        .with_description("Total number of node keys re-enqueued with backoff")
        .with_unit("{retries}")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

fn result_label(ok: bool) -> KeyValue {
    KeyValue::new("result", if ok { "success" } else { "error" })
}

/// Record a node reconciliation with timing
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        NODE_RECONCILE_DURATION.record(self.start.elapsed().as_secs_f64(), &[result_label(true)]);
    }

    /// Record error completion
    pub fn error(self, error_type: &'static str) {
        NODE_RECONCILE_DURATION.record(self.start.elapsed().as_secs_f64(), &[result_label(false)]);
        NODE_RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}

/// Record a schedulable label patch attempt
pub fn record_schedulable_patch(schedulable: bool, ok: bool) {
    SCHEDULABLE_PATCHES.add(
        1,
        &[
            KeyValue::new("value", if schedulable { "true" } else { "false" }),
            result_label(ok),
        ],
    );
}

/// Record a VM failure transition attempt
pub fn record_vm_failure_transition(ok: bool) {
    VM_FAILURE_TRANSITIONS.add(1, &[result_label(ok)]);
}

/// Record a queue retry
pub fn record_queue_retry() {
    QUEUE_RETRIES.add(1, &[]);
}
