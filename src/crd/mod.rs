//! Custom Resource Definitions for kiln
//!
//! This module contains the LLMWorkload CRD and its supporting types.

mod types;
mod workload;

pub use types::{
    Condition, ConditionStatus, MetricKind, ModelSize, ModelSpec, NodePreference, PlacementSpec,
    ResourceSpec, ScalingSpec, ScalingStrategy, SecuritySpec, SlaSpec, TargetMetric,
    WorkloadMetrics, WorkloadPhase,
};
pub use workload::{LLMWorkload, LLMWorkloadSpec, LLMWorkloadStatus};

/// Condition types written by the reconciler
pub mod conditions {
    /// The workload's replicas are all ready
    pub const READY: &str = "Ready";
    /// The workload is converging toward its spec
    pub const PROGRESSING: &str = "Progressing";
    /// The workload is running but below its SLA envelope
    pub const DEGRADED: &str = "Degraded";
}
