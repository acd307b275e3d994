//! Cluster capacity cache
//!
//! The capacity cache is the one piece of process-wide shared state: a
//! periodically refreshed, self-consistent view of every node's resource
//! envelope plus the allocations kiln has handed out. Readers take a snapshot;
//! writers (allocation bookkeeping and the refresh loop) serialize behind a
//! readers/writer lock. No caller holds the lock across a platform call: the
//! refresh task gathers observations first and applies them in one short
//! critical section.
//!
//! `available` is always derived (`allocatable - used`), never stored
//! independently, and is recomputed after every mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::resources::quantity;
use crate::resources::QosClass;
use crate::Error;

/// Node label carrying the topology zone
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Extended resource name for NVIDIA GPUs
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// A resource envelope in canonical units: fractional cores, bytes,
/// whole GPUs, bytes of storage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceCapacity {
    /// CPU in fractional cores
    pub cpu: f64,
    /// Memory in bytes
    pub memory: f64,
    /// GPU count
    pub gpu: i64,
    /// Storage in bytes
    pub storage: f64,
}

impl ResourceCapacity {
    /// Component-wise addition
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            gpu: self.gpu + other.gpu,
            storage: self.storage + other.storage,
        }
    }

    /// Component-wise subtraction, clamped at zero
    pub fn minus(&self, other: &Self) -> Self {
        Self {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            gpu: (self.gpu - other.gpu).max(0),
            storage: (self.storage - other.storage).max(0.0),
        }
    }

    /// Component-wise maximum
    pub fn max(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            gpu: self.gpu.max(other.gpu),
            storage: self.storage.max(other.storage),
        }
    }

    /// True when every dimension of `self` fits within `other`
    pub fn fits_within(&self, other: &Self) -> bool {
        self.cpu <= other.cpu
            && self.memory <= other.memory
            && self.gpu <= other.gpu
            && self.storage <= other.storage
    }
}

/// Per-dimension utilization percentages (0-100)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceUtilization {
    /// CPU utilization percent
    pub cpu: f64,
    /// Memory utilization percent
    pub memory: f64,
    /// GPU utilization percent
    pub gpu: f64,
    /// Storage utilization percent
    pub storage: f64,
}

impl ResourceUtilization {
    fn ratio(used: f64, allocatable: f64) -> f64 {
        if allocatable > 0.0 {
            (used / allocatable) * 100.0
        } else {
            0.0
        }
    }

    /// Derive utilization from a used/allocatable pair
    pub fn derive(used: &ResourceCapacity, allocatable: &ResourceCapacity) -> Self {
        Self {
            cpu: Self::ratio(used.cpu, allocatable.cpu),
            memory: Self::ratio(used.memory, allocatable.memory),
            gpu: Self::ratio(used.gpu as f64, allocatable.gpu as f64),
            storage: Self::ratio(used.storage, allocatable.storage),
        }
    }
}

/// Node performance characteristics, populated from node annotations where
/// the cluster exposes them
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodePerformance {
    /// CPU base frequency in GHz
    pub cpu_frequency_ghz: f64,
    /// Memory bandwidth in GB/s
    pub memory_bandwidth_gbps: f64,
    /// Network bandwidth in Gbps
    pub network_bandwidth_gbps: f64,
    /// Storage IOPS
    pub storage_iops: f64,
    /// Temperature in Celsius
    pub temperature_celsius: f64,
}

/// A node taint relevant to placement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaintInfo {
    /// Taint key
    pub key: String,
    /// Taint effect (NoSchedule, PreferNoSchedule, NoExecute)
    pub effect: String,
}

/// Per-node resource snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct NodeResourceInfo {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node taints
    pub taints: Vec<TaintInfo>,
    /// Whether the node is cordoned
    pub unschedulable: bool,
    /// Total capacity
    pub capacity: ResourceCapacity,
    /// Allocatable capacity
    pub allocatable: ResourceCapacity,
    /// Currently used
    pub used: ResourceCapacity,
    /// Derived: allocatable - used
    pub available: ResourceCapacity,
    /// Derived utilization percentages
    pub utilization: ResourceUtilization,
    /// Number of kiln workloads allocated to this node
    pub workload_count: u32,
    /// Models resident on this node (fed by allocations)
    pub cached_models: BTreeSet<String>,
    /// Performance characteristics
    pub performance: NodePerformance,
    /// When this entry was last updated
    pub last_updated: DateTime<Utc>,
}

impl NodeResourceInfo {
    /// Topology zone from the standard label, if present
    pub fn zone(&self) -> Option<&str> {
        self.labels.get(ZONE_LABEL).map(String::as_str)
    }

    /// Recompute `available` and utilization after a used/allocatable change
    fn recompute_derived(&mut self) {
        self.available = self.allocatable.minus(&self.used);
        self.utilization = ResourceUtilization::derive(&self.used, &self.allocatable);
        self.last_updated = Utc::now();
    }
}

/// Cluster-wide roll-up over all node entries
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterResourceInfo {
    /// Sum of node capacities
    pub total_capacity: ResourceCapacity,
    /// Sum of node allocatables
    pub total_allocatable: ResourceCapacity,
    /// Sum of node usage
    pub total_used: ResourceCapacity,
    /// Derived: allocatable - used
    pub total_available: ResourceCapacity,
    /// Derived utilization percentages
    pub utilization: ResourceUtilization,
    /// Number of known nodes
    pub node_count: u32,
    /// Number of live allocations
    pub workload_count: u32,
}

/// A placement decision: this workload runs on that node with this envelope
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceAllocation {
    /// Workload name
    pub workload_name: String,
    /// Workload namespace
    pub workload_namespace: String,
    /// Target node
    pub node_name: String,
    /// Requested envelope recorded against the node
    pub resources: ResourceCapacity,
    /// Quality class derived from the workload SLA
    pub qos_class: QosClass,
    /// Model the workload serves (feeds the locality score)
    pub model_name: String,
    /// When the allocation was made
    pub allocated_at: DateTime<Utc>,
}

impl ResourceAllocation {
    /// Cache key: `namespace/name`
    pub fn workload_key(&self) -> String {
        format!("{}/{}", self.workload_namespace, self.workload_name)
    }
}

/// An immutable, self-consistent view of the cluster
#[derive(Clone, Debug)]
pub struct CapacitySnapshot {
    /// Node entries, ordered by name for deterministic iteration
    pub nodes: Vec<NodeResourceInfo>,
    /// Cluster roll-up
    pub cluster: ClusterResourceInfo,
    /// When the underlying cache was last refreshed from the platform
    pub last_refresh: Option<DateTime<Utc>>,
    /// When this snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl CapacitySnapshot {
    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeResourceInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// What the refresh loop observed about one node
#[derive(Clone, Debug, Default)]
pub struct NodeObservation {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node taints
    pub taints: Vec<TaintInfo>,
    /// Whether the node is cordoned
    pub unschedulable: bool,
    /// Total capacity
    pub capacity: ResourceCapacity,
    /// Allocatable capacity
    pub allocatable: ResourceCapacity,
    /// Usage reported by the metrics source, when available
    pub used: Option<ResourceCapacity>,
    /// Performance characteristics
    pub performance: NodePerformance,
}

#[derive(Debug, Default)]
struct CacheState {
    nodes: BTreeMap<String, NodeResourceInfo>,
    allocations: BTreeMap<String, ResourceAllocation>,
    cluster: ClusterResourceInfo,
    last_refresh: Option<DateTime<Utc>>,
}

impl CacheState {
    fn recompute_cluster(&mut self) {
        let mut cluster = ClusterResourceInfo {
            node_count: self.nodes.len() as u32,
            workload_count: self.allocations.len() as u32,
            ..Default::default()
        };

        for node in self.nodes.values() {
            cluster.total_capacity = cluster.total_capacity.plus(&node.capacity);
            cluster.total_allocatable = cluster.total_allocatable.plus(&node.allocatable);
            cluster.total_used = cluster.total_used.plus(&node.used);
        }
        cluster.total_available = cluster.total_allocatable.minus(&cluster.total_used);
        cluster.utilization =
            ResourceUtilization::derive(&cluster.total_used, &cluster.total_allocatable);

        self.cluster = cluster;
    }

    fn allocated_on(&self, node_name: &str) -> ResourceCapacity {
        self.allocations
            .values()
            .filter(|a| a.node_name == node_name)
            .fold(ResourceCapacity::default(), |acc, a| acc.plus(&a.resources))
    }
}

/// The capacity cache. See the module docs for the locking discipline.
#[derive(Debug, Default)]
pub struct CapacityCache {
    state: RwLock<CacheState>,
}

impl CapacityCache {
    /// Create an empty cache; populated by the first refresh
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take an immutable snapshot of all known nodes plus cluster totals.
    ///
    /// Atomic with respect to concurrent `apply_allocation` calls: a snapshot
    /// reflects an allocation entirely or not at all.
    pub fn snapshot(&self) -> CapacitySnapshot {
        let state = self.read_state();
        CapacitySnapshot {
            nodes: state.nodes.values().cloned().collect(),
            cluster: state.cluster.clone(),
            last_refresh: state.last_refresh,
            taken_at: Utc::now(),
        }
    }

    /// Record an allocation: adjust the node's used/available and increment
    /// its workload count, atomically.
    pub fn apply_allocation(&self, allocation: &ResourceAllocation) -> Result<(), Error> {
        let mut state = self.write_state();

        let key = allocation.workload_key();
        if state.allocations.contains_key(&key) {
            return Err(Error::internal(format!(
                "allocation for {key} already recorded"
            )));
        }

        let node = state
            .nodes
            .get_mut(&allocation.node_name)
            .ok_or_else(|| {
                Error::internal(format!("unknown node {}", allocation.node_name))
            })?;

        let new_used = node.used.plus(&allocation.resources);
        if !new_used.fits_within(&node.allocatable) {
            return Err(Error::internal(format!(
                "allocation for {key} would exceed allocatable on node {}",
                allocation.node_name
            )));
        }

        node.used = new_used;
        node.workload_count += 1;
        node.cached_models.insert(allocation.model_name.clone());
        node.recompute_derived();

        state.allocations.insert(key, allocation.clone());
        state.recompute_cluster();
        Ok(())
    }

    /// Reverse a recorded allocation. Returns the allocation if one existed.
    pub fn release_allocation(&self, workload_key: &str) -> Option<ResourceAllocation> {
        let mut state = self.write_state();

        let allocation = state.allocations.remove(workload_key)?;
        if let Some(node) = state.nodes.get_mut(&allocation.node_name) {
            node.used = node.used.minus(&allocation.resources);
            node.workload_count = node.workload_count.saturating_sub(1);
            node.recompute_derived();
        }
        state.recompute_cluster();
        Some(allocation)
    }

    /// The live allocation for a workload, if any
    pub fn allocation_for(&self, workload_key: &str) -> Option<ResourceAllocation> {
        self.read_state().allocations.get(workload_key).cloned()
    }

    /// All live allocations on a node
    pub fn allocations_on(&self, node_name: &str) -> Vec<ResourceAllocation> {
        self.read_state()
            .allocations
            .values()
            .filter(|a| a.node_name == node_name)
            .cloned()
            .collect()
    }

    /// Reconcile the cache against fresh platform observations.
    ///
    /// Allocations not yet reflected in upstream usage are preserved: per
    /// node, `used` is the component-wise max of the observed usage and the
    /// sum of live allocations. Cached-model knowledge survives refreshes;
    /// nodes that disappeared upstream are dropped.
    pub fn apply_observations(&self, observations: Vec<NodeObservation>) {
        let now = Utc::now();
        let mut state = self.write_state();

        let mut nodes = BTreeMap::new();
        for obs in observations {
            let allocated = state.allocated_on(&obs.name);
            let observed_used = obs.used.unwrap_or_default();
            let used = observed_used.max(&allocated);

            let previous = state.nodes.get(&obs.name);
            let cached_models = previous
                .map(|n| n.cached_models.clone())
                .unwrap_or_default();
            let workload_count = state
                .allocations
                .values()
                .filter(|a| a.node_name == obs.name)
                .count() as u32;

            let mut node = NodeResourceInfo {
                name: obs.name.clone(),
                labels: obs.labels,
                taints: obs.taints,
                unschedulable: obs.unschedulable,
                capacity: obs.capacity,
                allocatable: obs.allocatable,
                used,
                available: ResourceCapacity::default(),
                utilization: ResourceUtilization::default(),
                workload_count,
                cached_models,
                performance: obs.performance,
                last_updated: now,
            };
            node.recompute_derived();
            nodes.insert(obs.name, node);
        }

        state.nodes = nodes;
        state.last_refresh = Some(now);
        state.recompute_cluster();
    }

    /// When the cache was last refreshed from the platform
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.read_state().last_refresh
    }

    /// True if the cache has been refreshed within `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        match self.last_refresh() {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|a| a <= max_age).unwrap_or(true)
            }
            None => false,
        }
    }
}

/// Source of node observations for the refresh loop
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeStateProvider: Send + Sync {
    /// Observe the current node set from the platform
    async fn observe_nodes(&self) -> Result<Vec<NodeObservation>, Error>;
}

/// Production provider backed by the Kubernetes API
pub struct KubeNodeProvider {
    client: Client,
}

impl KubeNodeProvider {
    /// Create a provider using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn capacity_from(resources: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>) -> ResourceCapacity {
        let mut capacity = ResourceCapacity::default();
        let Some(resources) = resources else {
            return capacity;
        };

        if let Some(cpu) = resources.get("cpu") {
            capacity.cpu = quantity::parse_cpu(&cpu.0).unwrap_or(0.0);
        }
        if let Some(memory) = resources.get("memory") {
            capacity.memory = quantity::parse_memory(&memory.0).unwrap_or(0.0);
        }
        if let Some(gpu) = resources.get(GPU_RESOURCE) {
            capacity.gpu = gpu.0.parse().unwrap_or(0);
        }
        if let Some(storage) = resources.get("ephemeral-storage") {
            capacity.storage = quantity::parse_memory(&storage.0).unwrap_or(0.0);
        }
        capacity
    }

    fn observation_from(node: &Node) -> NodeObservation {
        let name = node.metadata.name.clone().unwrap_or_default();
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let spec = node.spec.as_ref();
        let status = node.status.as_ref();

        let taints = spec
            .and_then(|s| s.taints.as_ref())
            .map(|taints| {
                taints
                    .iter()
                    .map(|t| TaintInfo {
                        key: t.key.clone(),
                        effect: t.effect.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        NodeObservation {
            name,
            labels,
            taints,
            unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
            capacity: Self::capacity_from(status.and_then(|s| s.capacity.as_ref())),
            allocatable: Self::capacity_from(status.and_then(|s| s.allocatable.as_ref())),
            used: None,
            performance: NodePerformance::default(),
        }
    }
}

#[async_trait]
impl NodeStateProvider for KubeNodeProvider {
    async fn observe_nodes(&self) -> Result<Vec<NodeObservation>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(Self::observation_from).collect())
    }
}

/// Periodic refresh loop: observe outside the lock, apply in one critical
/// section, repeat until cancelled.
pub async fn run_refresh_loop(
    cache: std::sync::Arc<CapacityCache>,
    provider: std::sync::Arc<dyn NodeStateProvider>,
    interval: Duration,
    deadline: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("capacity refresh loop stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(deadline, provider.observe_nodes()).await {
            Ok(Ok(observations)) => {
                debug!(nodes = observations.len(), "refreshed node observations");
                cache.apply_observations(observations);
            }
            Ok(Err(e)) => warn!(error = %e, "node observation failed"),
            Err(_) => warn!(deadline = ?deadline, "node observation timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn node_observation(name: &str, cpu: f64, memory_gib: f64, gpu: i64) -> NodeObservation {
        NodeObservation {
            name: name.to_string(),
            capacity: ResourceCapacity {
                cpu,
                memory: memory_gib * 1073741824.0,
                gpu,
                storage: 0.0,
            },
            allocatable: ResourceCapacity {
                cpu,
                memory: memory_gib * 1073741824.0,
                gpu,
                storage: 0.0,
            },
            ..Default::default()
        }
    }

    fn allocation(name: &str, node: &str, cpu: f64, memory_gib: f64, gpu: i64) -> ResourceAllocation {
        ResourceAllocation {
            workload_name: name.to_string(),
            workload_namespace: "default".to_string(),
            node_name: node.to_string(),
            resources: ResourceCapacity {
                cpu,
                memory: memory_gib * 1073741824.0,
                gpu,
                storage: 0.0,
            },
            qos_class: QosClass::Standard,
            model_name: "llama-7b".to_string(),
            allocated_at: Utc::now(),
        }
    }

    fn populated_cache() -> CapacityCache {
        let cache = CapacityCache::new();
        cache.apply_observations(vec![
            node_observation("node-a", 8.0, 64.0, 2),
            node_observation("node-b", 8.0, 64.0, 2),
        ]);
        cache
    }

    // =========================================================================
    // Story: Allocation Conservation
    // =========================================================================
    //
    // For any sequence of apply/release calls, per node: used equals the sum
    // of active allocations, and used + available equals allocatable.

    #[test]
    fn story_used_equals_sum_of_active_allocations() {
        let cache = populated_cache();

        cache
            .apply_allocation(&allocation("w1", "node-a", 2.0, 8.0, 1))
            .expect("first allocation fits");
        cache
            .apply_allocation(&allocation("w2", "node-a", 1.0, 4.0, 0))
            .expect("second allocation fits");

        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.used.cpu, 3.0);
        assert_eq!(node.used.memory, 12.0 * 1073741824.0);
        assert_eq!(node.used.gpu, 1);
        assert_eq!(node.workload_count, 2);

        // used + available == allocatable on every dimension
        assert_eq!(node.used.plus(&node.available), node.allocatable);

        cache.release_allocation("default/w1").expect("w1 released");
        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.used.cpu, 1.0);
        assert_eq!(node.workload_count, 1);
        assert_eq!(node.used.plus(&node.available), node.allocatable);

        cache.release_allocation("default/w2").expect("w2 released");
        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.used, ResourceCapacity::default());
        assert_eq!(node.available, node.allocatable);
    }

    #[test]
    fn story_releasing_unknown_allocation_is_a_noop() {
        let cache = populated_cache();
        assert!(cache.release_allocation("default/ghost").is_none());
    }

    // =========================================================================
    // Story: One Live Allocation Per Workload
    // =========================================================================

    #[test]
    fn story_double_allocation_is_rejected() {
        let cache = populated_cache();
        cache
            .apply_allocation(&allocation("w1", "node-a", 2.0, 8.0, 0))
            .expect("first apply succeeds");

        let err = cache
            .apply_allocation(&allocation("w1", "node-b", 2.0, 8.0, 0))
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));

        // node-b untouched
        let node_b = cache.snapshot().node("node-b").cloned().expect("node-b");
        assert_eq!(node_b.used, ResourceCapacity::default());
    }

    #[test]
    fn story_allocation_beyond_allocatable_is_rejected() {
        let cache = populated_cache();
        let err = cache
            .apply_allocation(&allocation("w1", "node-a", 100.0, 8.0, 0))
            .unwrap_err();
        assert!(err.to_string().contains("exceed allocatable"));
    }

    #[test]
    fn story_allocation_on_unknown_node_is_rejected() {
        let cache = populated_cache();
        let err = cache
            .apply_allocation(&allocation("w1", "node-z", 1.0, 1.0, 0))
            .unwrap_err();
        assert!(err.to_string().contains("unknown node"));
    }

    // =========================================================================
    // Story: Refresh Preserves Unreflected Allocations
    // =========================================================================
    //
    // The platform's usage reporting lags allocation decisions by up to one
    // refresh cycle. A refresh must not make capacity we just handed out
    // look free again.

    #[test]
    fn story_refresh_preserves_allocations_not_yet_upstream() {
        let cache = populated_cache();
        cache
            .apply_allocation(&allocation("w1", "node-a", 2.0, 8.0, 1))
            .expect("allocation fits");

        // Platform still reports zero usage for node-a
        cache.apply_observations(vec![
            node_observation("node-a", 8.0, 64.0, 2),
            node_observation("node-b", 8.0, 64.0, 2),
        ]);

        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.used.cpu, 2.0);
        assert_eq!(node.used.gpu, 1);
        assert_eq!(node.workload_count, 1);
    }

    #[test]
    fn story_refresh_takes_max_of_observed_and_allocated() {
        let cache = populated_cache();
        cache
            .apply_allocation(&allocation("w1", "node-a", 2.0, 8.0, 0))
            .expect("allocation fits");

        // Platform reports more CPU in use than we allocated (other pods)
        let mut obs = node_observation("node-a", 8.0, 64.0, 2);
        obs.used = Some(ResourceCapacity {
            cpu: 5.0,
            memory: 4.0 * 1073741824.0,
            gpu: 0,
            storage: 0.0,
        });
        cache.apply_observations(vec![obs]);

        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.used.cpu, 5.0);
        assert_eq!(node.used.memory, 8.0 * 1073741824.0);
    }

    #[test]
    fn story_refresh_drops_departed_nodes() {
        let cache = populated_cache();
        cache.apply_observations(vec![node_observation("node-a", 8.0, 64.0, 2)]);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(snapshot.node("node-b").is_none());
        assert_eq!(snapshot.cluster.node_count, 1);
    }

    #[test]
    fn story_cached_models_survive_refresh() {
        let cache = populated_cache();
        cache
            .apply_allocation(&allocation("w1", "node-a", 2.0, 8.0, 0))
            .expect("allocation fits");

        cache.apply_observations(vec![
            node_observation("node-a", 8.0, 64.0, 2),
            node_observation("node-b", 8.0, 64.0, 2),
        ]);

        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert!(node.cached_models.contains("llama-7b"));
    }

    // =========================================================================
    // Story: Derived Values and Roll-Ups
    // =========================================================================

    #[test]
    fn story_utilization_is_derived_from_used() {
        let cache = populated_cache();
        cache
            .apply_allocation(&allocation("w1", "node-a", 4.0, 32.0, 1))
            .expect("allocation fits");

        let node = cache.snapshot().node("node-a").cloned().expect("node-a");
        assert_eq!(node.utilization.cpu, 50.0);
        assert_eq!(node.utilization.memory, 50.0);
        assert_eq!(node.utilization.gpu, 50.0);
    }

    #[test]
    fn story_cluster_rollup_tracks_node_changes() {
        let cache = populated_cache();
        let before = cache.snapshot().cluster.clone();
        assert_eq!(before.total_allocatable.cpu, 16.0);
        assert_eq!(before.node_count, 2);
        assert_eq!(before.workload_count, 0);

        cache
            .apply_allocation(&allocation("w1", "node-a", 4.0, 16.0, 0))
            .expect("allocation fits");

        let after = cache.snapshot().cluster.clone();
        assert_eq!(after.total_used.cpu, 4.0);
        assert_eq!(after.total_available.cpu, 12.0);
        assert_eq!(after.workload_count, 1);
    }

    #[test]
    fn story_freshness_tracks_refresh_time() {
        let cache = CapacityCache::new();
        assert!(!cache.is_fresh(Duration::from_secs(90)));

        cache.apply_observations(vec![node_observation("node-a", 8.0, 64.0, 0)]);
        assert!(cache.is_fresh(Duration::from_secs(90)));
    }

    #[test]
    fn story_snapshot_nodes_are_name_ordered() {
        let cache = CapacityCache::new();
        cache.apply_observations(vec![
            node_observation("node-c", 1.0, 1.0, 0),
            node_observation("node-a", 1.0, 1.0, 0),
            node_observation("node-b", 1.0, 1.0, 0),
        ]);

        let names: Vec<_> = cache.snapshot().nodes.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["node-a", "node-b", "node-c"]);
    }
}
