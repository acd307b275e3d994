//! Prometheus metrics for the orchestrator
//!
//! Counters for reconcile outcomes and allocations, histograms for
//! reconcile latency and placement scores, gauges for workload phases and
//! per-node utilization.

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;

/// Histogram buckets for reconcile latency (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Histogram buckets for placement scores (0-100)
const SCORE_BUCKETS: &[f64] = &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct MetricsInner {
    reconciles_total: IntCounter,
    reconcile_failures_total: IntCounterVec,
    allocations_total: IntCounter,
    reconcile_duration_seconds: Histogram,
    placement_score: Histogram,
    workloads_by_phase: IntGaugeVec,
    node_utilization_ratio: GaugeVec,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            reconciles_total: register_int_counter!(
                "kiln_reconciles_total",
                "Total number of workload reconcile passes"
            )
            .expect("Failed to register reconciles_total"),

            reconcile_failures_total: register_int_counter_vec!(
                "kiln_reconcile_failures_total",
                "Reconcile failures by reason",
                &["reason"]
            )
            .expect("Failed to register reconcile_failures_total"),

            allocations_total: register_int_counter!(
                "kiln_allocations_total",
                "Total number of resource allocations recorded"
            )
            .expect("Failed to register allocations_total"),

            reconcile_duration_seconds: register_histogram!(
                "kiln_reconcile_duration_seconds",
                "Time spent in a single reconcile pass",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            placement_score: register_histogram!(
                "kiln_placement_score",
                "Winning node score for placement decisions",
                SCORE_BUCKETS.to_vec()
            )
            .expect("Failed to register placement_score"),

            workloads_by_phase: register_int_gauge_vec!(
                "kiln_workloads_by_phase",
                "Number of workloads per lifecycle phase",
                &["phase"]
            )
            .expect("Failed to register workloads_by_phase"),

            node_utilization_ratio: register_gauge_vec!(
                "kiln_node_utilization_ratio",
                "Node utilization ratio (0-1) by node and dimension",
                &["node", "dimension"]
            )
            .expect("Failed to register node_utilization_ratio"),
        }
    }
}

/// Orchestrator metrics handle
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct Metrics {
    _private: (),
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a metrics handle (initializes the global registry if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static MetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Count one reconcile pass
    pub fn inc_reconciles(&self) {
        self.inner().reconciles_total.inc();
    }

    /// Count one reconcile failure with its reason label
    pub fn inc_reconcile_failure(&self, reason: &str) {
        self.inner()
            .reconcile_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Count one recorded allocation
    pub fn inc_allocations(&self) {
        self.inner().allocations_total.inc();
    }

    /// Record a reconcile latency observation
    pub fn observe_reconcile_duration(&self, duration_secs: f64) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
    }

    /// Record the winning placement score
    pub fn observe_placement_score(&self, score: f64) {
        self.inner().placement_score.observe(score);
    }

    /// Set the gauge for a workload phase
    pub fn set_workloads_by_phase(&self, phase: &str, count: i64) {
        self.inner()
            .workloads_by_phase
            .with_label_values(&[phase])
            .set(count);
    }

    /// Set a node's utilization ratio for one dimension
    pub fn set_node_utilization(&self, node: &str, dimension: &str, ratio: f64) {
        self.inner()
            .node_utilization_ratio
            .with_label_values(&[node, dimension])
            .set(ratio);
    }
}
