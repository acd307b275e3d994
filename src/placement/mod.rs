//! Placement engine
//!
//! Scores feasible nodes for a workload and returns a ranked list. The
//! engine is pure: identical inputs produce identical rankings, which the
//! tie-break chain guarantees down to the node name. Hard constraints are
//! filtered before any scoring; a node dropped by a constraint is never
//! promoted back by a tie-break.

use std::collections::BTreeSet;

use tracing::debug;

use crate::capacity::{NodeResourceInfo, ResourceCapacity};
use crate::crd::PlacementSpec;
use crate::resources::QosClass;

/// Node label carrying the instance type
const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
/// Node label marking SSD-backed storage
const SSD_LABEL: &str = "storage.kubernetes.io/ssd";
/// Node label carrying the network bandwidth class
const BANDWIDTH_LABEL: &str = "networking.kubernetes.io/bandwidth";

/// Performance bonus per instance type, on top of the base score of 50
const INSTANCE_TYPE_BONUS: &[(&str, f64)] = &[
    ("c5.xlarge", 10.0),
    ("c5.2xlarge", 15.0),
    ("c5.4xlarge", 20.0),
    ("p3.2xlarge", 30.0),
    ("p3.8xlarge", 40.0),
    ("p4d.24xlarge", 50.0),
];

/// Placement engine configuration
#[derive(Clone, Debug)]
pub struct PlacementConfig {
    /// Prefer nodes (and zones) where the model is already resident
    pub locality_preference: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            locality_preference: true,
        }
    }
}

/// Sub-score weights; must sum to 100
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreWeights {
    /// Weight for resource headroom
    pub resource: f64,
    /// Weight for node-label affinity
    pub affinity: f64,
    /// Weight for model locality
    pub locality: f64,
    /// Weight for node performance
    pub performance: f64,
}

impl ScoreWeights {
    /// Weights for latency-sensitive premium workloads
    pub fn premium() -> Self {
        Self {
            resource: 20.0,
            affinity: 20.0,
            locality: 30.0,
            performance: 30.0,
        }
    }

    /// Default weights
    pub fn standard() -> Self {
        Self {
            resource: 40.0,
            affinity: 20.0,
            locality: 20.0,
            performance: 20.0,
        }
    }

    /// Select weights for a quality class
    pub fn for_qos(qos: QosClass) -> Self {
        match qos {
            QosClass::Premium => Self::premium(),
            QosClass::Standard | QosClass::Basic => Self::standard(),
        }
    }
}

/// Per-factor breakdown of a node's score
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Resource headroom sub-score (0-100)
    pub resource: f64,
    /// Affinity sub-score (0-100)
    pub affinity: f64,
    /// Locality sub-score (0-100)
    pub locality: f64,
    /// Performance sub-score (0-100)
    pub performance: f64,
}

/// A scored candidate node
#[derive(Clone, Debug)]
pub struct NodeScore {
    /// Node name
    pub node: String,
    /// Final weighted score in [0, 100]
    pub score: f64,
    /// Sub-score breakdown
    pub breakdown: ScoreBreakdown,
    /// Human-readable scoring notes
    pub reasons: Vec<String>,
    /// Available resources at scoring time (first tie-break input)
    pub available: ResourceCapacity,
    /// Workload count at scoring time (second tie-break input)
    pub workload_count: u32,
}

/// What the engine needs to know about the workload being placed
#[derive(Clone, Debug)]
pub struct PlacementRequest {
    /// Workload key, for logging
    pub workload_key: String,
    /// Model the workload serves
    pub model_name: String,
    /// Quality class, selects the weight set
    pub qos_class: QosClass,
    /// Requested envelope
    pub requested: ResourceCapacity,
    /// Hard constraints and soft preferences from the spec
    pub placement: Option<PlacementSpec>,
}

/// Result of ranking: scored candidates plus the constraint rejections
#[derive(Clone, Debug, Default)]
pub struct PlacementOutcome {
    /// Candidates ordered best-first
    pub ranked: Vec<NodeScore>,
    /// Nodes dropped by hard constraints, with the reason
    pub rejected: Vec<(String, String)>,
}

impl PlacementOutcome {
    /// The winning node, if any candidate survived
    pub fn best(&self) -> Option<&NodeScore> {
        self.ranked.first()
    }
}

/// The placement engine. Pure and deterministic; owns no shared state.
#[derive(Clone, Debug, Default)]
pub struct PlacementEngine {
    config: PlacementConfig,
}

impl PlacementEngine {
    /// Create an engine with the given configuration
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    /// Rank the feasible nodes for a workload.
    ///
    /// `model_zones` is the set of zones where the model is already resident
    /// anywhere in the cluster (not just among the feasible nodes), feeding
    /// the same-zone locality tier.
    pub fn rank(
        &self,
        request: &PlacementRequest,
        nodes: &[NodeResourceInfo],
        model_zones: &BTreeSet<String>,
    ) -> PlacementOutcome {
        let mut outcome = PlacementOutcome::default();

        for node in nodes {
            match self.check_constraints(request, node) {
                Some(reason) => {
                    debug!(
                        workload = %request.workload_key,
                        node = %node.name,
                        reason = %reason,
                        "node rejected by hard constraint"
                    );
                    outcome.rejected.push((node.name.clone(), reason));
                }
                None => outcome.ranked.push(self.score_node(request, node, model_zones)),
            }
        }

        // Strict descending score; ties broken by available CPU (desc),
        // workload count (asc), then node name for determinism.
        outcome.ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.available.cpu.total_cmp(&a.available.cpu))
                .then(a.workload_count.cmp(&b.workload_count))
                .then(a.node.cmp(&b.node))
        });

        outcome
    }

    /// Evaluate hard constraints; returns the rejection reason if any fails
    fn check_constraints(&self, request: &PlacementRequest, node: &NodeResourceInfo) -> Option<String> {
        if node.unschedulable {
            return Some("node is cordoned".to_string());
        }

        let placement = request.placement.as_ref();

        if let Some(placement) = placement {
            for (key, value) in &placement.node_selector {
                if node.labels.get(key) != Some(value) {
                    return Some(format!("node selector {key}={value} not satisfied"));
                }
            }

            if placement.avoid_nodes.iter().any(|n| n == &node.name) {
                return Some("node is anti-affinity excluded".to_string());
            }
        }

        let tolerated: &[String] = placement.map(|p| p.tolerated_taints.as_slice()).unwrap_or(&[]);
        for taint in &node.taints {
            // The GPU taint is tolerated implicitly; the deployment carries
            // the matching toleration.
            if taint.effect == "NoSchedule"
                && taint.key != crate::capacity::GPU_RESOURCE
                && !tolerated.contains(&taint.key)
            {
                return Some(format!("untolerated NoSchedule taint {}", taint.key));
            }
        }

        None
    }

    fn score_node(
        &self,
        request: &PlacementRequest,
        node: &NodeResourceInfo,
        model_zones: &BTreeSet<String>,
    ) -> NodeScore {
        let mut reasons = Vec::new();

        let breakdown = ScoreBreakdown {
            resource: self.resource_score(request, node),
            affinity: self.affinity_score(request, node, &mut reasons),
            locality: self.locality_score(request, node, model_zones, &mut reasons),
            performance: self.performance_score(node, &mut reasons),
        };

        let weights = ScoreWeights::for_qos(request.qos_class);
        let score = (breakdown.resource * weights.resource
            + breakdown.affinity * weights.affinity
            + breakdown.locality * weights.locality
            + breakdown.performance * weights.performance)
            / 100.0;

        NodeScore {
            node: node.name.clone(),
            score,
            breakdown,
            reasons,
            available: node.available,
            workload_count: node.workload_count,
        }
    }

    /// Headroom across CPU, memory and GPU, each as available/capacity
    fn resource_score(&self, request: &PlacementRequest, node: &NodeResourceInfo) -> f64 {
        fn headroom(available: f64, capacity: f64) -> f64 {
            if capacity > 0.0 {
                (available / capacity * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            }
        }

        let cpu = headroom(node.available.cpu, node.capacity.cpu);
        let memory = headroom(node.available.memory, node.capacity.memory);

        let gpu = if request.requested.gpu == 0 && node.capacity.gpu == 0 {
            100.0
        } else if request.requested.gpu > 0 && node.available.gpu == 0 {
            0.0
        } else {
            headroom(node.available.gpu as f64, node.capacity.gpu as f64)
        };

        (cpu + memory + gpu) / 3.0
    }

    /// Base 50 plus the weight of each satisfied preference, capped at 100
    fn affinity_score(
        &self,
        request: &PlacementRequest,
        node: &NodeResourceInfo,
        reasons: &mut Vec<String>,
    ) -> f64 {
        let mut score = 50.0;

        if let Some(placement) = &request.placement {
            for pref in &placement.preferences {
                if node.labels.get(&pref.key) == Some(&pref.value) {
                    score += pref.weight;
                    reasons.push(format!("preference {}={} satisfied", pref.key, pref.value));
                }
            }
        }

        score.min(100.0)
    }

    /// 100 if the model is resident on the node, 75 if resident in the same
    /// zone, 25 otherwise; neutral 50 when locality preference is disabled
    fn locality_score(
        &self,
        request: &PlacementRequest,
        node: &NodeResourceInfo,
        model_zones: &BTreeSet<String>,
        reasons: &mut Vec<String>,
    ) -> f64 {
        if !self.config.locality_preference {
            return 50.0;
        }

        if node.cached_models.contains(&request.model_name) {
            reasons.push(format!("model {} cached on node", request.model_name));
            return 100.0;
        }

        if let Some(zone) = node.zone() {
            if model_zones.contains(zone) {
                reasons.push(format!("model {} cached in zone {zone}", request.model_name));
                return 75.0;
            }
        }

        25.0
    }

    /// Base 50 plus bonuses for instance tier, SSD storage, and network
    /// bandwidth labels, capped at 100
    fn performance_score(&self, node: &NodeResourceInfo, reasons: &mut Vec<String>) -> f64 {
        let mut score = 50.0;

        if let Some(instance_type) = node.labels.get(INSTANCE_TYPE_LABEL) {
            if let Some((_, bonus)) = INSTANCE_TYPE_BONUS
                .iter()
                .find(|(name, _)| name == instance_type)
            {
                score += bonus;
                reasons.push(format!("instance type {instance_type}"));
            }
        }

        if node.labels.contains_key(SSD_LABEL) {
            score += 10.0;
            reasons.push("ssd storage".to_string());
        }

        if let Some(bandwidth) = node.labels.get(BANDWIDTH_LABEL) {
            score += Self::bandwidth_bonus(bandwidth);
        }

        score.min(100.0)
    }

    fn bandwidth_bonus(bandwidth: &str) -> f64 {
        match crate::resources::quantity::parse_memory(bandwidth) {
            Some(bits) if bits >= 100e9 => 15.0,
            Some(bits) if bits >= 25e9 => 10.0,
            Some(bits) if bits >= 10e9 => 5.0,
            _ => 0.0,
        }
    }
}
