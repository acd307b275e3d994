//! LLMWorkload Custom Resource Definition
//!
//! The LLMWorkload CRD is the declarative unit kiln manages: one inference
//! service with its model identity, resource appetite, scaling policy, and
//! SLA envelope. The reconciler owns the status subresource; external
//! operators own the spec.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ModelSpec, PlacementSpec, ResourceSpec, ScalingSpec, SecuritySpec, SlaSpec,
    WorkloadMetrics, WorkloadPhase,
};
use crate::resources::quantity;

/// Specification for an LLMWorkload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1alpha1",
    kind = "LLMWorkload",
    plural = "llmworkloads",
    shortname = "llmw",
    status = "LLMWorkloadStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LLMWorkloadSpec {
    /// Model identity and serving parameters
    pub model: ModelSpec,

    /// Requested resource appetite
    #[serde(default)]
    pub resources: ResourceSpec,

    /// Replica bounds and scaling policy
    #[serde(default)]
    pub scaling: ScalingSpec,

    /// Performance SLA targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<SlaSpec>,

    /// Security hints forwarded to child objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySpec>,

    /// Placement constraints and preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementSpec>,
}

impl LLMWorkloadSpec {
    /// Validate the workload specification
    ///
    /// Each rejection names the offending field so submitters can fix their
    /// manifest without guessing.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.model.name.trim().is_empty() {
            return Err(crate::Error::validation("model.name must not be empty"));
        }

        if self.scaling.min_replicas < 1 {
            return Err(crate::Error::validation(
                "scaling.minReplicas must be at least 1",
            ));
        }

        if self.scaling.max_replicas < self.scaling.min_replicas {
            return Err(crate::Error::validation(format!(
                "scaling.maxReplicas ({}) must be >= scaling.minReplicas ({})",
                self.scaling.max_replicas, self.scaling.min_replicas
            )));
        }

        if let Some(cpu) = &self.resources.cpu {
            if quantity::parse_cpu(cpu).is_none() {
                return Err(crate::Error::validation(format!(
                    "resources.cpu: {cpu:?} is not a valid CPU quantity (expected e.g. \"2000m\" or \"2\")"
                )));
            }
        }

        if let Some(memory) = &self.resources.memory {
            if quantity::parse_memory(memory).is_none() {
                return Err(crate::Error::validation(format!(
                    "resources.memory: {memory:?} is not a valid memory quantity (expected e.g. \"8Gi\")"
                )));
            }
        }

        if let Some(placement) = &self.placement {
            for pref in &placement.preferences {
                if !(0.0..=100.0).contains(&pref.weight) {
                    return Err(crate::Error::validation(format!(
                        "placement.preferences[{}]: weight {} must be between 0 and 100",
                        pref.key, pref.weight
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Status for an LLMWorkload, written exclusively by the reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LLMWorkloadStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: WorkloadPhase,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the workload state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Observed replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_replicas: Option<i32>,

    /// Observed ready replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    /// Last time the replica count changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,

    /// Latest observed performance snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkloadMetrics>,

    /// Network endpoints exposed by the workload's Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,

    /// Node hosting the workload's allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl LLMWorkloadStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: WorkloadPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    ///
    /// An existing condition of the same type is replaced in place, keeping
    /// at most one entry per condition type.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Look up a condition by type
    pub fn condition_of(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl LLMWorkload {
    /// The workload's cache/lock key: `namespace/name`
    pub fn workload_key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("unknown")
        )
    }
}
