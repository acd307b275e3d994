//! Supporting types for the LLMWorkload CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Model size class, used to scale the base resource envelope
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ModelSize {
    /// Models up to roughly 3B parameters
    Small,
    /// Models up to roughly 13B parameters
    #[default]
    Medium,
    /// Models up to roughly 40B parameters
    Large,
    /// Models beyond 40B parameters
    Xlarge,
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
            Self::Xlarge => write!(f, "xlarge"),
        }
    }
}

/// Model identity and serving parameters
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Model name as registered in the model registry
    pub name: String,

    /// Model version; empty or "latest" resolves to the newest published version
    #[serde(default = "default_model_version")]
    pub version: String,

    /// Model type (e.g. text-generation, embedding)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Size class driving the resource multipliers
    #[serde(default)]
    pub size: ModelSize,

    /// Free-form serving parameters, projected verbatim into the ConfigMap
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

fn default_model_version() -> String {
    "latest".to_string()
}

impl ModelSpec {
    /// The version to resolve, normalizing empty to "latest"
    pub fn effective_version(&self) -> &str {
        if self.version.is_empty() {
            "latest"
        } else {
            &self.version
        }
    }
}

/// Requested resource appetite, in Kubernetes quantity notation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request (e.g. "2000m"); falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory request (e.g. "8Gi"); falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Number of GPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,

    /// Storage request (e.g. "50Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Network bandwidth hint (e.g. "10G")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_bandwidth: Option<String>,
}

/// Metric kinds a scaling policy can target
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MetricKind {
    /// CPU utilization percentage
    Cpu,
    /// Memory utilization percentage
    Memory,
    /// Requests per second
    Rps,
    /// Inference queue depth
    QueueLength,
    /// Request latency in milliseconds
    Latency,
}

/// A single scaling target
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetMetric {
    /// Which metric to track
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Target value for the metric
    pub target: f64,
}

/// Scaling strategy for the workload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ScalingStrategy {
    /// Add or remove replicas
    #[default]
    Horizontal,
    /// Grow or shrink the per-replica envelope
    Vertical,
    /// Combine both
    Hybrid,
}

/// Replica bounds and scaling policy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    /// Minimum replica count
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,

    /// Maximum replica count
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Ordered scaling targets; first match wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_metrics: Vec<TargetMetric>,

    /// Minimum seconds between scale-up operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_cooldown_secs: Option<u32>,

    /// Minimum seconds between scale-down operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_cooldown_secs: Option<u32>,

    /// Scaling strategy
    #[serde(default)]
    pub strategy: ScalingStrategy,
}

fn default_min_replicas() -> i32 {
    1
}

fn default_max_replicas() -> i32 {
    1
}

impl Default for ScalingSpec {
    fn default() -> Self {
        Self {
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            target_metrics: Vec::new(),
            scale_up_cooldown_secs: None,
            scale_down_cooldown_secs: None,
            strategy: ScalingStrategy::default(),
        }
    }
}

/// Performance SLA targets; drives the quality class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaSpec {
    /// Maximum acceptable request latency in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u32>,

    /// Minimum sustained throughput in requests per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_throughput: Option<f64>,

    /// Expected concurrent users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_users: Option<u32>,

    /// P95 response-time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<u32>,

    /// P99 response-time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99_ms: Option<u32>,

    /// Maximum acceptable error rate (0.0 to 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,

    /// Availability target as a percentage (e.g. 99.9)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<f64>,
}

/// Security hints, opaque to placement and forwarded to child objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Whether traffic/storage encryption is required
    #[serde(default)]
    pub encryption: bool,

    /// Compliance regime identifier (e.g. "hipaa")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_level: Option<String>,

    /// Data classification label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
}

/// A soft node preference contributing to the affinity score
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePreference {
    /// Node label key
    pub key: String,
    /// Expected label value
    pub value: String,
    /// Score contribution when satisfied (0-100)
    pub weight: f64,
}

/// Placement constraints and preferences
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    /// Hard node-label equality requirements
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Node names the workload must never land on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoid_nodes: Vec<String>,

    /// Soft preferences contributing to the affinity score
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<NodePreference>,

    /// Taint keys the workload tolerates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerated_taints: Vec<String>,
}

/// Workload lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkloadPhase {
    /// Spec observed, no children written yet
    #[default]
    Pending,
    /// Children written, replicas converging
    Progressing,
    /// All replicas ready
    Running,
    /// Terminal error; waiting for a spec change
    Failed,
    /// Deletion in progress; children being torn down
    Terminating,
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

impl WorkloadPhase {
    /// All phases, for metrics gauge initialization
    pub fn all() -> [WorkloadPhase; 5] {
        [
            Self::Pending,
            Self::Progressing,
            Self::Running,
            Self::Failed,
            Self::Terminating,
        ]
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Ready, Progressing, Degraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Observed workload performance snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetrics {
    /// Requests per second across all replicas
    #[serde(default)]
    pub requests_per_second: f64,

    /// Average request latency in milliseconds
    #[serde(default)]
    pub average_latency_ms: f64,

    /// Error rate (0.0 to 1.0)
    #[serde(default)]
    pub error_rate: f64,

    /// When this snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod model_spec {
        use super::*;

        #[test]
        fn test_effective_version_normalizes_empty() {
            let mut spec = ModelSpec {
                name: "llama-7b".to_string(),
                version: String::new(),
                model_type: None,
                size: ModelSize::Medium,
                parameters: BTreeMap::new(),
            };
            assert_eq!(spec.effective_version(), "latest");

            spec.version = "v2".to_string();
            assert_eq!(spec.effective_version(), "v2");
        }

        #[test]
        fn test_version_defaults_to_latest() {
            let spec: ModelSpec =
                serde_yaml::from_str("name: llama-7b").expect("minimal spec parses");
            assert_eq!(spec.version, "latest");
            assert_eq!(spec.size, ModelSize::Medium);
        }
    }

    mod phases {
        use super::*;

        #[test]
        fn test_display_matches_kubernetes_convention() {
            assert_eq!(WorkloadPhase::Pending.to_string(), "Pending");
            assert_eq!(WorkloadPhase::Progressing.to_string(), "Progressing");
            assert_eq!(WorkloadPhase::Running.to_string(), "Running");
            assert_eq!(WorkloadPhase::Failed.to_string(), "Failed");
            assert_eq!(WorkloadPhase::Terminating.to_string(), "Terminating");
        }

        #[test]
        fn test_all_covers_every_phase() {
            assert_eq!(WorkloadPhase::all().len(), 5);
        }
    }

    mod scaling {
        use super::*;

        #[test]
        fn test_defaults_are_single_replica_horizontal() {
            let spec = ScalingSpec::default();
            assert_eq!(spec.min_replicas, 1);
            assert_eq!(spec.max_replicas, 1);
            assert_eq!(spec.strategy, ScalingStrategy::Horizontal);
        }

        #[test]
        fn test_metric_kind_serde_names() {
            let metric: TargetMetric =
                serde_yaml::from_str("type: queue_length\ntarget: 10").expect("parses");
            assert_eq!(metric.kind, MetricKind::QueueLength);
        }
    }

    mod conditions {
        use super::*;

        #[test]
        fn test_new_sets_transition_time() {
            let before = Utc::now();
            let cond = Condition::new(
                "Ready",
                ConditionStatus::True,
                "DeploymentReady",
                "All replicas are ready",
            );
            assert!(cond.last_transition_time >= before);
            assert_eq!(cond.status.to_string(), "True");
        }
    }
}
