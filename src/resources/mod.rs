//! Resource manager
//!
//! Turns a workload spec into a concrete resource envelope (model-size,
//! model-type and quality-class multipliers over the textual requests),
//! filters the capacity snapshot down to feasible nodes, asks the placement
//! engine to rank them, and records the winning allocation in the capacity
//! cache. A background loop watches for node imbalance and emits migration
//! suggestions.

pub mod quantity;
mod rebalance;

pub use rebalance::{run_rebalance_loop, MigrationSuggestion};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capacity::{
    CapacityCache, CapacitySnapshot, NodeResourceInfo, ResourceAllocation, ResourceCapacity,
};
use crate::crd::{LLMWorkload, LLMWorkloadSpec, SlaSpec};
use crate::placement::{PlacementEngine, PlacementOutcome, PlacementRequest};
use crate::Error;

/// Quality class derived from the workload SLA
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QosClass {
    /// Availability >= 99.9% and P95 <= 100ms
    Premium,
    /// Availability >= 99.5% and P95 <= 500ms
    Standard,
    /// Everything else
    #[default]
    Basic,
}

impl std::fmt::Display for QosClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Premium => write!(f, "premium"),
            Self::Standard => write!(f, "standard"),
            Self::Basic => write!(f, "basic"),
        }
    }
}

/// Derive the quality class from SLA targets.
///
/// Thresholds are fixed, matching the sizing tables.
pub fn qos_class_for(sla: Option<&SlaSpec>) -> QosClass {
    let Some(sla) = sla else {
        return QosClass::Basic;
    };
    let availability = sla.availability.unwrap_or(0.0);
    let p95 = sla.p95_ms.unwrap_or(u32::MAX);

    if availability >= 99.9 && p95 <= 100 {
        QosClass::Premium
    } else if availability >= 99.5 && p95 <= 500 {
        QosClass::Standard
    } else {
        QosClass::Basic
    }
}

/// Multiplicative factors on CPU, memory and GPU
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Multipliers {
    /// CPU factor
    pub cpu: f64,
    /// Memory factor
    pub memory: f64,
    /// GPU factor
    pub gpu: f64,
}

impl Multipliers {
    const IDENTITY: Multipliers = Multipliers {
        cpu: 1.0,
        memory: 1.0,
        gpu: 1.0,
    };

    fn compose(&self, other: &Multipliers) -> Multipliers {
        Multipliers {
            cpu: self.cpu * other.cpu,
            memory: self.memory * other.memory,
            gpu: self.gpu * other.gpu,
        }
    }
}

/// Model-size multipliers. The GPU factor is capped so xlarge uses at most
/// twice the baseline GPU count.
pub fn size_multipliers(size: crate::crd::ModelSize) -> Multipliers {
    use crate::crd::ModelSize;
    match size {
        ModelSize::Small => Multipliers {
            cpu: 0.5,
            memory: 0.5,
            gpu: 0.5,
        },
        ModelSize::Medium => Multipliers::IDENTITY,
        ModelSize::Large => Multipliers {
            cpu: 2.0,
            memory: 2.0,
            gpu: 1.5,
        },
        ModelSize::Xlarge => Multipliers {
            cpu: 4.0,
            memory: 4.0,
            gpu: 2.0,
        },
    }
}

/// Model-type multipliers, keyed by substring match on the model name.
///
/// First match in table order wins; unknown model families are neutral.
pub fn type_multipliers(model_name: &str) -> Multipliers {
    const TABLE: &[(&str, Multipliers)] = &[
        ("llama", Multipliers { cpu: 1.2, memory: 1.5, gpu: 1.0 }),
        ("gpt", Multipliers { cpu: 1.0, memory: 1.2, gpu: 1.0 }),
        ("bert", Multipliers { cpu: 0.8, memory: 0.8, gpu: 0.8 }),
        ("t5", Multipliers { cpu: 1.1, memory: 1.3, gpu: 1.0 }),
        ("gemini", Multipliers { cpu: 1.3, memory: 1.4, gpu: 1.1 }),
    ];

    for (family, multipliers) in TABLE {
        if model_name.contains(family) {
            return *multipliers;
        }
    }
    Multipliers::IDENTITY
}

/// Per-class CPU and memory factors; premium inflates requests
fn qos_multipliers(qos: QosClass) -> (f64, f64) {
    match qos {
        QosClass::Premium => (1.5, 2.0),
        QosClass::Standard | QosClass::Basic => (1.0, 1.0),
    }
}

/// Resource manager configuration
#[derive(Clone, Debug)]
pub struct ResourceManagerConfig {
    /// CPU request applied when the spec omits one
    pub default_cpu_request: String,
    /// Memory request applied when the spec omits one
    pub default_memory_request: String,
    /// GPU count applied when the spec omits one
    pub default_gpu_request: i64,
    /// Per-dimension utilization ceiling for feasibility (0.0 to 1.0)
    pub utilization_target: f64,
    /// CPU or memory utilization above this marks a node overutilized
    pub scale_up_threshold: f64,
    /// Average utilization below this marks a node underutilized
    pub scale_down_threshold: f64,
    /// Per-workload CPU ceiling
    pub max_cpu_per_workload: String,
    /// Per-workload memory ceiling
    pub max_memory_per_workload: String,
    /// Per-workload GPU ceiling
    pub max_gpu_per_workload: i64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            default_cpu_request: "1000m".to_string(),
            default_memory_request: "2Gi".to_string(),
            default_gpu_request: 0,
            utilization_target: 0.8,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            max_cpu_per_workload: "8000m".to_string(),
            max_memory_per_workload: "32Gi".to_string(),
            max_gpu_per_workload: 4,
        }
    }
}

/// A computed requested/limit envelope plus the derived quality class
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRequirements {
    /// Requested envelope
    pub requested: ResourceCapacity,
    /// Limit envelope (1.5x requests; GPU limits equal requests)
    pub limits: ResourceCapacity,
    /// Quality class derived from the SLA
    pub qos_class: QosClass,
}

/// The resource manager. Owns no platform connections; everything flows
/// through the capacity cache and the placement engine.
pub struct ResourceManager {
    cache: Arc<CapacityCache>,
    engine: PlacementEngine,
    config: ResourceManagerConfig,
}

impl ResourceManager {
    /// Create a manager over the given cache and placement engine
    pub fn new(
        cache: Arc<CapacityCache>,
        engine: PlacementEngine,
        config: ResourceManagerConfig,
    ) -> Self {
        Self {
            cache,
            engine,
            config,
        }
    }

    /// The capacity cache backing this manager
    pub fn cache(&self) -> &Arc<CapacityCache> {
        &self.cache
    }

    /// The manager configuration
    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    fn parse_or_default(value: Option<&str>, default: &str, parse: fn(&str) -> Option<f64>, field: &str) -> f64 {
        if let Some(value) = value {
            if let Some(parsed) = parse(value) {
                return parsed;
            }
            warn!(field, value, default, "unparseable quantity, using default");
        }
        parse(default).unwrap_or(0.0)
    }

    /// Compute the requested/limit envelope for a workload spec.
    ///
    /// Multipliers compose by multiplication: base request x size x type,
    /// then the QoS class inflates CPU and memory. Limits are 1.5x requests
    /// with GPU limits pinned to requests, and everything is clipped at the
    /// configured per-workload maxima.
    pub fn size(&self, spec: &LLMWorkloadSpec) -> ResourceRequirements {
        let base_cpu = Self::parse_or_default(
            spec.resources.cpu.as_deref(),
            &self.config.default_cpu_request,
            quantity::parse_cpu,
            "resources.cpu",
        );
        let base_memory = Self::parse_or_default(
            spec.resources.memory.as_deref(),
            &self.config.default_memory_request,
            quantity::parse_memory,
            "resources.memory",
        );
        let base_gpu = spec
            .resources
            .gpu
            .map(i64::from)
            .unwrap_or(self.config.default_gpu_request) as f64;

        let multipliers =
            size_multipliers(spec.model.size).compose(&type_multipliers(&spec.model.name));

        let qos_class = qos_class_for(spec.sla.as_ref());
        let (qos_cpu, qos_memory) = qos_multipliers(qos_class);

        let requested_cpu = base_cpu * multipliers.cpu * qos_cpu;
        let requested_memory = base_memory * multipliers.memory * qos_memory;
        let requested_gpu = base_gpu * multipliers.gpu;

        let max_cpu = quantity::parse_cpu(&self.config.max_cpu_per_workload).unwrap_or(f64::MAX);
        let max_memory =
            quantity::parse_memory(&self.config.max_memory_per_workload).unwrap_or(f64::MAX);
        let max_gpu = self.config.max_gpu_per_workload;

        let requested = ResourceCapacity {
            cpu: requested_cpu.min(max_cpu),
            memory: requested_memory.min(max_memory),
            gpu: (requested_gpu as i64).min(max_gpu),
            storage: spec
                .resources
                .storage
                .as_deref()
                .and_then(quantity::parse_memory)
                .unwrap_or(0.0),
        };

        let limits = ResourceCapacity {
            cpu: (requested.cpu * 1.5).min(max_cpu),
            memory: (requested.memory * 1.5).min(max_memory),
            gpu: requested.gpu,
            storage: requested.storage,
        };

        ResourceRequirements {
            requested,
            limits,
            qos_class,
        }
    }

    /// Nodes whose headroom admits the envelope without exceeding the
    /// utilization target on CPU or memory
    fn feasible_nodes<'a>(
        &self,
        snapshot: &'a CapacitySnapshot,
        requested: &ResourceCapacity,
    ) -> Vec<&'a NodeResourceInfo> {
        let target_pct = self.config.utilization_target * 100.0;
        snapshot
            .nodes
            .iter()
            .filter(|node| {
                node.available.cpu >= requested.cpu
                    && node.available.memory >= requested.memory
                    && node.available.gpu >= requested.gpu
                    && node.utilization.cpu <= target_pct
                    && node.utilization.memory <= target_pct
            })
            .collect()
    }

    /// Zones where the model is already resident anywhere in the cluster
    fn model_zones(snapshot: &CapacitySnapshot, model_name: &str) -> BTreeSet<String> {
        snapshot
            .nodes
            .iter()
            .filter(|node| node.cached_models.contains(model_name))
            .filter_map(|node| node.zone().map(String::from))
            .collect()
    }

    /// Ensure the workload has a live allocation, creating one if needed.
    ///
    /// Returns the allocation plus the placement outcome when a new decision
    /// was made (None when an existing allocation was reused). Idempotent:
    /// a workload has at most one live allocation.
    pub fn ensure_allocation(
        &self,
        workload: &LLMWorkload,
    ) -> Result<(ResourceAllocation, Option<PlacementOutcome>), Error> {
        let key = workload.workload_key();

        if let Some(existing) = self.cache.allocation_for(&key) {
            debug!(workload = %key, node = %existing.node_name, "reusing live allocation");
            return Ok((existing, None));
        }

        let requirements = self.size(&workload.spec);
        let snapshot = self.cache.snapshot();

        let feasible: Vec<NodeResourceInfo> = self
            .feasible_nodes(&snapshot, &requirements.requested)
            .into_iter()
            .cloned()
            .collect();

        if feasible.is_empty() {
            return Err(Error::no_feasible_node(format!(
                "0 of {} nodes admit cpu={:.2} memory={:.0} gpu={}",
                snapshot.nodes.len(),
                requirements.requested.cpu,
                requirements.requested.memory,
                requirements.requested.gpu
            )));
        }

        let request = PlacementRequest {
            workload_key: key.clone(),
            model_name: workload.spec.model.name.clone(),
            qos_class: requirements.qos_class,
            requested: requirements.requested,
            placement: workload.spec.placement.clone(),
        };
        let zones = Self::model_zones(&snapshot, &workload.spec.model.name);
        let outcome = self.engine.rank(&request, &feasible, &zones);

        let best = outcome.best().ok_or_else(|| {
            Error::no_feasible_node(format!(
                "all {} feasible nodes rejected by placement constraints",
                feasible.len()
            ))
        })?;

        let allocation = ResourceAllocation {
            workload_name: workload.metadata.name.clone().unwrap_or_default(),
            workload_namespace: workload
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            node_name: best.node.clone(),
            resources: requirements.requested,
            qos_class: requirements.qos_class,
            model_name: workload.spec.model.name.clone(),
            allocated_at: chrono::Utc::now(),
        };

        self.cache.apply_allocation(&allocation)?;

        info!(
            workload = %key,
            node = %allocation.node_name,
            score = best.score,
            cpu = allocation.resources.cpu,
            memory = allocation.resources.memory,
            gpu = allocation.resources.gpu,
            qos = %allocation.qos_class,
            "allocated resources"
        );

        Ok((allocation, Some(outcome)))
    }

    /// Release the workload's allocation, if it has one
    pub fn release(&self, workload_key: &str) -> Option<ResourceAllocation> {
        let released = self.cache.release_allocation(workload_key);
        if let Some(allocation) = &released {
            info!(
                workload = %workload_key,
                node = %allocation.node_name,
                "released allocation"
            );
        }
        released
    }
}
