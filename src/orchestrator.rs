//! Orchestrator shell
//!
//! Wires the components together and owns the task set: capacity refresh,
//! rebalancing, metrics collection, health checking, leader election, the
//! metrics/health HTTP servers, and the reconcile controller itself. Only
//! the leader reconciles; followers stay warm and take over on lease
//! expiry.
//!
//! Shutdown ordering: the stop signal cancels every periodic task and stops
//! the controller accepting new reconciles, in-flight reconciles drain
//! within a bounded grace period, and the leader lease is released last.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use kube::api::ListParams;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::{run_refresh_loop, CapacityCache, KubeNodeProvider};
use crate::crd::{LLMWorkload, WorkloadPhase};
use crate::leader::{LeaderConfig, LeaderElector, LeadershipHandle};
use crate::observability::{components, health_router, metrics_router, serve, HealthRegistry, Metrics};
use crate::placement::{PlacementConfig, PlacementEngine};
use crate::reconciler::{error_policy, reconcile, Context, KubePlatformClient, ReconcilerConfig};
use crate::registry::ModelRegistry;
use crate::resources::{run_rebalance_loop, ResourceManager, ResourceManagerConfig};

/// Top-level orchestrator configuration, assembled from CLI flags
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Namespace to watch; None watches all namespaces
    pub namespace: Option<String>,
    /// Port for the Prometheus metrics endpoint
    pub metrics_port: u16,
    /// Port for the health endpoint
    pub health_port: u16,
    /// Whether to run leader election
    pub leader_election: bool,
    /// Name of the leader election Lease
    pub leader_lock_name: String,
    /// Periodic requeue interval for workloads
    pub reconcile_interval: Duration,
    /// Bound on concurrently reconciled workloads
    pub max_concurrent_reconciles: usize,
    /// Capacity cache refresh interval
    pub refresh_interval: Duration,
    /// Rebalancing loop interval
    pub rebalance_interval: Duration,
    /// Health check interval
    pub health_interval: Duration,
    /// Metrics collection interval
    pub sync_interval: Duration,
    /// Deadline for platform API calls
    pub platform_timeout: Duration,
    /// Deadline for metrics pulls
    pub metrics_timeout: Duration,
    /// Drain budget for in-flight reconciles at shutdown
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            metrics_port: 8080,
            health_port: 8081,
            leader_election: false,
            leader_lock_name: "kiln-leader".to_string(),
            reconcile_interval: Duration::from_secs(30),
            max_concurrent_reconciles: 4,
            refresh_interval: Duration::from_secs(30),
            rebalance_interval: Duration::from_secs(300),
            health_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(30),
            platform_timeout: Duration::from_secs(10),
            metrics_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// The orchestrator: component wiring plus lifecycle
pub struct Orchestrator {
    client: Client,
    config: OrchestratorConfig,
    cache: Arc<CapacityCache>,
    resources: Arc<ResourceManager>,
    registry: Arc<dyn ModelRegistry>,
    health: HealthRegistry,
    metrics: Metrics,
}

impl Orchestrator {
    /// Wire the components over the given client and registry
    pub fn new(
        client: Client,
        registry: Arc<dyn ModelRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let cache = Arc::new(CapacityCache::new());
        let resources = Arc::new(ResourceManager::new(
            cache.clone(),
            PlacementEngine::new(PlacementConfig::default()),
            ResourceManagerConfig::default(),
        ));

        Self {
            client,
            config,
            cache,
            resources,
            registry,
            health: HealthRegistry::new(),
            metrics: Metrics::new(),
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let lease_cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        for name in [
            components::REGISTRY,
            components::CAPACITY_CACHE,
            components::RECONCILER,
            components::PLATFORM_API,
        ] {
            self.health.register(name).await;
        }

        // Exposition endpoints on their two ports
        tasks.push(tokio::spawn(run_server(
            self.config.metrics_port,
            metrics_router(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_server(
            self.config.health_port,
            health_router(self.health.clone()),
            cancel.clone(),
        )));

        // Periodic background tasks
        let provider = Arc::new(KubeNodeProvider::new(self.client.clone()));
        tasks.push(tokio::spawn(run_refresh_loop(
            self.cache.clone(),
            provider,
            self.config.refresh_interval,
            self.config.platform_timeout,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_rebalance_loop(
            self.resources.clone(),
            self.config.rebalance_interval,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_metrics_sync(
            self.client.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            self.config.clone(),
            cancel.clone(),
        )));

        // Leader election: followers park until the lease is theirs
        let leadership = if self.config.leader_election {
            let elector = LeaderElector::new(
                self.client.clone(),
                LeaderConfig {
                    lock_name: self.config.leader_lock_name.clone(),
                    namespace: self
                        .config
                        .namespace
                        .clone()
                        .unwrap_or_else(|| "default".to_string()),
                    ..Default::default()
                },
            );
            let handle = elector.handle();
            tasks.push(tokio::spawn(elector.run(lease_cancel.clone())));
            Some(handle)
        } else {
            None
        };

        tasks.push(tokio::spawn(run_health_loop(
            self.client.clone(),
            self.registry.clone(),
            self.cache.clone(),
            leadership.clone(),
            self.health.clone(),
            self.config.clone(),
            cancel.clone(),
        )));

        // Shutdown signal fans out through the token
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            signal_cancel.cancel();
        });

        if let Some(handle) = &leadership {
            info!("waiting for leadership");
            if !handle.wait_for_leadership(&cancel).await {
                info!("shutdown before leadership was acquired");
                lease_cancel.cancel();
                return Ok(());
            }
            info!("leadership acquired, starting controller");
        }

        self.run_controller(cancel.clone()).await;

        // Controller has drained; stop the lease loop so the lock releases
        // for the next leader
        lease_cancel.cancel();

        match tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(tasks),
        )
        .await
        {
            Ok(_) => info!("orchestrator stopped cleanly"),
            Err(_) => warn!(
                grace = ?self.config.shutdown_grace,
                "background tasks did not stop within the grace period"
            ),
        }
        Ok(())
    }

    /// Run the reconcile controller until the token fires, then drain
    /// in-flight reconciles within the grace period.
    async fn run_controller(&self, cancel: CancellationToken) {
        let platform = Arc::new(KubePlatformClient::new(
            self.client.clone(),
            self.config.platform_timeout,
        ));
        let ctx = Arc::new(Context::new(
            platform,
            self.registry.clone(),
            self.resources.clone(),
            ReconcilerConfig {
                reconcile_interval: self.config.reconcile_interval,
                platform_timeout: self.config.platform_timeout,
                ..Default::default()
            },
        ));

        let workloads: Api<LLMWorkload> = self.scoped_api();
        let deployments: Api<Deployment> = self.scoped_api();
        let services: Api<Service> = self.scoped_api();
        let config_maps: Api<ConfigMap> = self.scoped_api();

        let drain_started = cancel.clone();
        let stream = Controller::new(workloads, WatcherConfig::default())
            .owns(deployments, WatcherConfig::default())
            .owns(services, WatcherConfig::default())
            .owns(config_maps, WatcherConfig::default())
            .with_config(
                ControllerConfig::default().concurrency(self.config.max_concurrent_reconciles as u16),
            )
            .graceful_shutdown_on(cancel.cancelled_owned())
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((object, action)) => {
                        debug!(workload = %object.name, ?action, "reconciliation completed")
                    }
                    Err(e) => error!(error = %e, "reconciliation error"),
                }
            });
        tokio::pin!(stream);

        // Run until the shutdown signal; afterwards the stream only drains
        // in-flight reconciles, so bound that phase by the grace period.
        tokio::select! {
            () = &mut stream => {
                info!("controller stream completed");
                return;
            }
            _ = drain_started.cancelled() => {}
        }
        match tokio::time::timeout(self.config.shutdown_grace, stream).await {
            Ok(()) => info!("controller drained"),
            Err(_) => warn!("controller did not drain within the grace period"),
        }
    }

    fn scoped_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match &self.config.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

async fn run_server(port: u16, router: axum::Router, cancel: CancellationToken) {
    if let Err(e) = serve(port, router, cancel).await {
        error!(error = %e, port, "HTTP server failed");
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Count workloads per phase for the phase gauges
fn phase_counts(workloads: &[LLMWorkload]) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = WorkloadPhase::all()
        .iter()
        .map(|p| (p.to_string(), 0))
        .collect();
    for workload in workloads {
        let phase = workload
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default();
        *counts.entry(phase.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Periodic metrics collection: node utilization gauges and workload phase
/// counts
async fn run_metrics_sync(
    client: Client,
    cache: Arc<CapacityCache>,
    metrics: Metrics,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot = cache.snapshot();
        for node in &snapshot.nodes {
            metrics.set_node_utilization(&node.name, "cpu", node.utilization.cpu / 100.0);
            metrics.set_node_utilization(&node.name, "memory", node.utilization.memory / 100.0);
            metrics.set_node_utilization(&node.name, "gpu", node.utilization.gpu / 100.0);
        }

        let workloads: Api<LLMWorkload> = match &config.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        };
        match tokio::time::timeout(
            config.metrics_timeout,
            workloads.list(&ListParams::default()),
        )
        .await
        {
            Ok(Ok(list)) => {
                for (phase, count) in phase_counts(&list.items) {
                    metrics.set_workloads_by_phase(&phase, count);
                }
            }
            Ok(Err(e)) => debug!(error = %e, "workload list for metrics failed"),
            Err(_) => debug!("workload list for metrics timed out"),
        }
    }
}

/// Periodic health checks for the four tracked subsystems
async fn run_health_loop(
    client: Client,
    registry: Arc<dyn ModelRegistry>,
    cache: Arc<CapacityCache>,
    leadership: Option<LeadershipHandle>,
    health: HealthRegistry,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.health_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        // Platform API reachability
        let nodes: Api<Node> = Api::all(client.clone());
        let probe = tokio::time::timeout(
            config.platform_timeout,
            nodes.list(&ListParams::default().limit(1)),
        )
        .await;
        match probe {
            Ok(Ok(_)) => health.set_healthy(components::PLATFORM_API).await,
            Ok(Err(e)) => {
                health
                    .set_unhealthy(components::PLATFORM_API, format!("API error: {e}"))
                    .await
            }
            Err(_) => {
                health
                    .set_unhealthy(components::PLATFORM_API, "API probe timed out")
                    .await
            }
        }

        // Registry reachability
        match registry.probe().await {
            Ok(()) => health.set_healthy(components::REGISTRY).await,
            Err(e) => {
                health
                    .set_unhealthy(components::REGISTRY, e.to_string())
                    .await
            }
        }

        // Capacity cache freshness: stale after three missed refreshes
        if cache.is_fresh(config.refresh_interval * 3) {
            health.set_healthy(components::CAPACITY_CACHE).await;
        } else {
            health
                .set_unhealthy(components::CAPACITY_CACHE, "cache has not refreshed recently")
                .await;
        }

        // Reconciler: healthy whether leading or standing by
        let message = match &leadership {
            Some(handle) if handle.is_leader() => "leading",
            Some(_) => "standby",
            None => "leading (leader election disabled)",
        };
        health
            .update(
                components::RECONCILER,
                crate::observability::ComponentHealth {
                    status: crate::observability::ComponentStatus::Healthy,
                    message: Some(message.to_string()),
                    last_checked: chrono::Utc::now().timestamp(),
                },
            )
            .await;
    }
}
