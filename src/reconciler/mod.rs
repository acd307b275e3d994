//! LLMWorkload reconciler
//!
//! Implements the control loop for LLMWorkload resources following the
//! Kubernetes controller pattern: observe current state, determine desired
//! state, and apply the difference. One pass composes model resolution,
//! resource allocation, placement, and child-object convergence, then folds
//! observed child status back into the workload's status subresource.
//!
//! Error handling follows the taxonomy in [`crate::error`]: retryable errors
//! requeue with exponential backoff and preserve the current phase; terminal
//! errors move the workload to Failed and wait for a spec change.

pub mod children;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::capacity::ResourceAllocation;
use crate::crd::{
    conditions, Condition, ConditionStatus, LLMWorkload, LLMWorkloadStatus, WorkloadPhase,
};
use crate::observability::Metrics;
use crate::registry::ModelRegistry;
use crate::resources::ResourceManager;
use crate::Error;

/// Finalizer guarding orderly teardown of child objects
pub const FINALIZER: &str = "kiln.dev/finalizer";

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "kiln-controller";

/// Reconciler configuration
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Periodic requeue interval for healthy workloads
    pub reconcile_interval: Duration,
    /// Overall deadline for one reconcile pass
    pub reconcile_timeout: Duration,
    /// Deadline for individual platform calls
    pub platform_timeout: Duration,
    /// Base delay for the retry backoff
    pub backoff_base: Duration,
    /// Ceiling for the retry backoff
    pub backoff_cap: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(30),
            platform_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Trait abstracting the container platform operations the reconciler needs
///
/// Allows mocking the Kubernetes client in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Attach the kiln finalizer to a workload
    async fn ensure_finalizer(&self, workload: &LLMWorkload) -> Result<(), Error>;

    /// Remove the kiln finalizer from a workload
    async fn remove_finalizer(&self, workload: &LLMWorkload) -> Result<(), Error>;

    /// Patch a workload's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LLMWorkloadStatus,
    ) -> Result<(), Error>;

    /// Fetch a ConfigMap, None when absent
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Server-side apply a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Delete a ConfigMap; absent objects are not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a Deployment, None when absent
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Server-side apply a Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Delete a Deployment; absent objects are not an error
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a Service, None when absent
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Server-side apply a Service
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Delete a Service; absent objects are not an error
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Production platform client backed by kube
///
/// Every call carries the configured deadline; timeouts surface as
/// retryable [`Error::Timeout`].
pub struct KubePlatformClient {
    client: Client,
    timeout: Duration,
}

impl KubePlatformClient {
    /// Create a client with the given per-call deadline
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn deadline<T, F>(&self, what: &str, fut: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::timeout(format!(
                "{what} exceeded {:?} deadline",
                self.timeout
            ))),
        }
    }

    fn workloads(&self, namespace: &str) -> Api<LLMWorkload> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        workload: &LLMWorkload,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = workload.namespace().unwrap_or_else(|| "default".to_string());
        let name = workload.name_any();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });

        self.deadline(
            "finalizer patch",
            async {
                self.workloads(&namespace)
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_ignoring_absent<K>(
        &self,
        api: Api<K>,
        what: &str,
        name: &str,
    ) -> Result<(), Error>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let result = self
            .deadline(what, async { api.delete(name, &DeleteParams::default()).await })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::Kube(kube::Error::Api(ref e))) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PlatformClient for KubePlatformClient {
    async fn ensure_finalizer(&self, workload: &LLMWorkload) -> Result<(), Error> {
        let mut finalizers = workload.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(workload, finalizers).await
    }

    async fn remove_finalizer(&self, workload: &LLMWorkload) -> Result<(), Error> {
        let finalizers: Vec<String> = workload
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(workload, finalizers).await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LLMWorkloadStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.deadline("status patch", async {
            self.workloads(namespace)
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        })
        .await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("configmap get", async { api.get_opt(name).await })
            .await
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("configmap apply", async {
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(config_map),
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.delete_ignoring_absent(api, "configmap delete", name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("deployment get", async { api.get_opt(name).await })
            .await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        let namespace = deployment.metadata.namespace.as_deref().unwrap_or("default");
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("deployment apply", async {
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.delete_ignoring_absent(api, "deployment delete", name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("service get", async { api.get_opt(name).await })
            .await
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let name = service.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.deadline("service apply", async {
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(service),
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.delete_ignoring_absent(api, "service delete", name).await
    }
}

/// Controller context shared across reconciliation calls
pub struct Context {
    /// Platform operations (trait object for testability)
    pub platform: Arc<dyn PlatformClient>,
    /// Model registry adapter
    pub registry: Arc<dyn ModelRegistry>,
    /// Resource manager (sizing, allocation, rebalancing)
    pub resources: Arc<ResourceManager>,
    /// Metrics handle
    pub metrics: Metrics,
    /// Reconciler configuration
    pub config: ReconcilerConfig,
    /// Per-workload retry attempt counts, reset on success
    attempts: DashMap<String, u32>,
}

impl Context {
    /// Create a context over the given components
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        registry: Arc<dyn ModelRegistry>,
        resources: Arc<ResourceManager>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            platform,
            registry,
            resources,
            metrics: Metrics::new(),
            config,
            attempts: DashMap::new(),
        }
    }
}

/// Reconcile an LLMWorkload resource
///
/// Entry point invoked by the controller runtime for every watched change
/// and on the periodic requeue. Per-workload serialization and event
/// coalescing are the runtime's contract; this function only ever sees one
/// in-flight call per workload key.
#[instrument(skip(workload, ctx), fields(workload = %workload.workload_key()))]
pub async fn reconcile(workload: Arc<LLMWorkload>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = workload.workload_key();
    let start = std::time::Instant::now();
    ctx.metrics.inc_reconciles();
    debug!("reconciling workload");

    let result = match tokio::time::timeout(
        ctx.config.reconcile_timeout,
        reconcile_inner(&workload, &ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "reconcile exceeded {:?}",
            ctx.config.reconcile_timeout
        ))),
    };

    ctx.metrics
        .observe_reconcile_duration(start.elapsed().as_secs_f64());

    match result {
        Ok(action) => {
            ctx.attempts.remove(&key);
            Ok(action)
        }
        Err(e) => {
            ctx.metrics.inc_reconcile_failure(e.reason());
            handle_reconcile_error(&workload, &ctx, e).await
        }
    }
}

async fn reconcile_inner(workload: &LLMWorkload, ctx: &Context) -> Result<Action, Error> {
    let name = workload
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal("workload has no name"))?;
    let namespace = workload
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    if workload.metadata.deletion_timestamp.is_some() {
        return teardown(workload, ctx, &namespace, &name).await;
    }

    if !workload.finalizers().iter().any(|f| f == FINALIZER) {
        ctx.platform.ensure_finalizer(workload).await?;
    }

    workload.spec.validate()?;

    let resolved = ctx
        .registry
        .resolve(
            &workload.spec.model.name,
            workload.spec.model.effective_version(),
        )
        .await?;

    let requirements = ctx.resources.size(&workload.spec);
    let (allocation, placement) = ctx.resources.ensure_allocation(workload)?;
    if let Some(outcome) = &placement {
        ctx.metrics.inc_allocations();
        if let Some(best) = outcome.best() {
            ctx.metrics.observe_placement_score(best.score);
        }
    }

    ensure_config_map(workload, ctx, &namespace).await?;
    let live_deployment =
        ensure_deployment(workload, ctx, &namespace, &requirements, &resolved.image).await?;
    ensure_service(workload, ctx, &namespace, &name).await?;

    let status = desired_status(workload, live_deployment.as_ref(), Some(&allocation));
    if workload.status.as_ref() != Some(&status) {
        // Status write failures never block child reconciliation
        if let Err(e) = ctx.platform.patch_status(&namespace, &name, &status).await {
            warn!(error = %e, "status update failed");
        }
    }

    debug!("workload reconciliation complete");
    Ok(Action::requeue(ctx.config.reconcile_interval))
}

async fn ensure_config_map(
    workload: &LLMWorkload,
    ctx: &Context,
    namespace: &str,
) -> Result<(), Error> {
    let desired = children::build_config_map(workload);
    let name = desired.metadata.name.clone().unwrap_or_default();

    match ctx.platform.get_config_map(namespace, &name).await? {
        Some(live) => {
            if !children::is_owned_by(&live.metadata, workload) {
                return Err(Error::conflict(format!(
                    "configmap {namespace}/{name} exists but is not owned by this workload"
                )));
            }
            if live.data != desired.data {
                info!(configmap = %name, "updating config map");
                ctx.platform.apply_config_map(&desired).await?;
            }
        }
        None => {
            info!(configmap = %name, "creating config map");
            ctx.platform.apply_config_map(&desired).await?;
        }
    }
    Ok(())
}

async fn ensure_deployment(
    workload: &LLMWorkload,
    ctx: &Context,
    namespace: &str,
    requirements: &crate::resources::ResourceRequirements,
    image: &str,
) -> Result<Option<Deployment>, Error> {
    let desired = children::build_deployment(workload, requirements, image);
    let name = desired.metadata.name.clone().unwrap_or_default();

    let live = ctx.platform.get_deployment(namespace, &name).await?;
    match &live {
        Some(existing) => {
            if !children::is_owned_by(&existing.metadata, workload) {
                return Err(Error::conflict(format!(
                    "deployment {namespace}/{name} exists but is not owned by this workload"
                )));
            }
            if existing.spec != desired.spec {
                info!(deployment = %name, "updating deployment");
                ctx.platform.apply_deployment(&desired).await?;
            }
        }
        None => {
            info!(deployment = %name, "creating deployment");
            ctx.platform.apply_deployment(&desired).await?;
        }
    }
    Ok(live)
}

async fn ensure_service(
    workload: &LLMWorkload,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let desired = children::build_service(workload);

    match ctx.platform.get_service(namespace, name).await? {
        Some(live) => {
            if !children::is_owned_by(&live.metadata, workload) {
                return Err(Error::conflict(format!(
                    "service {namespace}/{name} exists but is not owned by this workload"
                )));
            }
            if live.spec != desired.spec {
                info!(service = %name, "updating service");
                ctx.platform.apply_service(&desired).await?;
            }
        }
        None => {
            info!(service = %name, "creating service");
            ctx.platform.apply_service(&desired).await?;
        }
    }
    Ok(())
}

/// Tear down children in reverse dependency order, release the allocation,
/// then drop the finalizer. The finalizer is only removed once every child
/// delete has succeeded, so the workload record never disappears while
/// owned objects remain.
async fn teardown(
    workload: &LLMWorkload,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action, Error> {
    info!("tearing down workload");

    let already_terminating = workload
        .status
        .as_ref()
        .map(|s| s.phase == WorkloadPhase::Terminating)
        .unwrap_or(false);
    if !already_terminating {
        let status = LLMWorkloadStatus::with_phase(WorkloadPhase::Terminating)
            .message("deleting child objects")
            .condition(Condition::new(
                conditions::READY,
                ConditionStatus::False,
                "Terminating",
                "Workload is being deleted",
            ));
        if let Err(e) = ctx.platform.patch_status(namespace, name, &status).await {
            warn!(error = %e, "status update failed during teardown");
        }
    }

    ctx.platform.delete_service(namespace, name).await?;
    ctx.platform.delete_deployment(namespace, name).await?;
    ctx.platform
        .delete_config_map(namespace, &children::config_map_name(name))
        .await?;

    ctx.resources.release(&workload.workload_key());

    ctx.platform.remove_finalizer(workload).await?;
    info!("workload teardown complete");
    Ok(Action::await_change())
}

/// Compute the workload status implied by the observed deployment.
///
/// Condition timestamps are preserved when the status and reason are
/// unchanged, so an idle workload produces a byte-identical status and the
/// reconciler skips the write.
pub fn desired_status(
    workload: &LLMWorkload,
    deployment: Option<&Deployment>,
    allocation: Option<&ResourceAllocation>,
) -> LLMWorkloadStatus {
    let previous = workload.status.clone().unwrap_or_default();

    let desired_replicas = deployment
        .and_then(|d| d.spec.as_ref())
        .and_then(|s| s.replicas)
        .unwrap_or(workload.spec.scaling.min_replicas);
    let current_replicas = deployment
        .and_then(|d| d.status.as_ref())
        .and_then(|s| s.replicas);
    let ready_replicas = deployment
        .and_then(|d| d.status.as_ref())
        .and_then(|s| s.ready_replicas);

    let all_ready = ready_replicas.unwrap_or(0) == desired_replicas
        && desired_replicas > 0
        && current_replicas.unwrap_or(0) == desired_replicas;

    let (phase, message, ready, progressing) = if all_ready {
        (
            WorkloadPhase::Running,
            "all replicas are ready".to_string(),
            Condition::new(
                conditions::READY,
                ConditionStatus::True,
                "DeploymentReady",
                "All replicas are ready",
            ),
            Condition::new(
                conditions::PROGRESSING,
                ConditionStatus::True,
                "DeploymentComplete",
                "Deployment has converged",
            ),
        )
    } else {
        (
            WorkloadPhase::Progressing,
            format!(
                "waiting for replicas: {}/{} ready",
                ready_replicas.unwrap_or(0),
                desired_replicas
            ),
            Condition::new(
                conditions::READY,
                ConditionStatus::False,
                "DeploymentNotReady",
                "Waiting for replicas to become ready",
            ),
            Condition::new(
                conditions::PROGRESSING,
                ConditionStatus::True,
                "DeploymentRollingOut",
                "Deployment is converging",
            ),
        )
    };

    let last_scale_time = if previous.current_replicas != current_replicas {
        Some(Utc::now())
    } else {
        previous.last_scale_time
    };

    LLMWorkloadStatus {
        phase,
        message: Some(message),
        conditions: Vec::new(),
        current_replicas,
        ready_replicas,
        last_scale_time,
        metrics: previous.metrics.clone(),
        endpoints: children::service_endpoints(workload),
        node: allocation.map(|a| a.node_name.clone()),
    }
    .condition(merge_condition(&previous, ready))
    .condition(merge_condition(&previous, progressing))
}

/// Keep the previous transition time and message when a condition's status
/// and reason are unchanged
fn merge_condition(previous: &LLMWorkloadStatus, mut condition: Condition) -> Condition {
    if let Some(existing) = previous.condition_of(&condition.type_) {
        if existing.status == condition.status && existing.reason == condition.reason {
            condition.last_transition_time = existing.last_transition_time;
            condition.message = existing.message.clone();
        }
    }
    condition
}

/// Classify a failed reconcile and decide what happens to the workload.
///
/// Retryable errors propagate so [`error_policy`] can requeue with backoff.
/// Terminal errors write a Failed status and stop requeueing; a spec edit
/// generates the next event.
async fn handle_reconcile_error(
    workload: &LLMWorkload,
    ctx: &Context,
    error: Error,
) -> Result<Action, Error> {
    let key = workload.workload_key();
    let namespace = workload
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let name = workload.name_any();

    if let Error::NoFeasibleNode(ref detail) = error {
        // Stay in the current phase; surface unschedulability as a condition
        let previous = workload.status.clone().unwrap_or_default();
        let status = previous.condition(Condition::new(
            conditions::PROGRESSING,
            ConditionStatus::False,
            "Unschedulable",
            detail.clone(),
        ));
        if let Err(e) = ctx.platform.patch_status(&namespace, &name, &status).await {
            warn!(error = %e, "status update failed");
        }
        return Err(error);
    }

    if error.is_retryable() {
        return Err(error);
    }

    // Internal invariant violations get exactly one retry before going
    // terminal
    if matches!(error, Error::Internal(_)) {
        let attempts = ctx.attempts.get(&key).map(|a| *a).unwrap_or(0);
        if attempts == 0 {
            warn!(error = %error, "internal error, retrying once");
            return Err(error);
        }
    }

    warn!(error = %error, reason = error.reason(), "workload failed");
    let status = LLMWorkloadStatus::with_phase(WorkloadPhase::Failed)
        .message(error.to_string())
        .condition(Condition::new(
            conditions::READY,
            ConditionStatus::False,
            error.reason(),
            error.to_string(),
        ));
    if let Err(e) = ctx.platform.patch_status(&namespace, &name, &status).await {
        warn!(error = %e, "status update failed");
    }

    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Requeues with bounded exponential backoff; the attempt counter is reset
/// by the next successful reconcile.
pub fn error_policy(workload: Arc<LLMWorkload>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = workload.workload_key();
    let attempt = {
        let mut entry = ctx.attempts.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };

    let exponent = attempt.saturating_sub(1).min(16);
    let delay = std::cmp::min(
        ctx.config.backoff_base.saturating_mul(1u32 << exponent),
        ctx.config.backoff_cap,
    );

    error!(
        error = %error,
        workload = %workload.workload_key(),
        attempt,
        delay_secs = delay.as_secs(),
        "reconciliation failed, requeueing"
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{CapacityCache, NodeObservation, ResourceCapacity};
    use crate::crd::{LLMWorkloadSpec, ModelSize, ModelSpec, ResourceSpec, ScalingSpec, SlaSpec};
    use crate::placement::PlacementEngine;
    use crate::registry::{MockModelRegistry, ResolvedModel};
    use crate::resources::ResourceManagerConfig;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::collections::BTreeMap;

    const GIB: f64 = 1073741824.0;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_workload() -> LLMWorkload {
        LLMWorkload {
            metadata: kube::api::ObjectMeta {
                name: Some("llama".to_string()),
                namespace: Some("inference".to_string()),
                uid: Some("uid-123".to_string()),
                finalizers: Some(vec![FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: LLMWorkloadSpec {
                model: ModelSpec {
                    name: "llama-7b".to_string(),
                    version: "v1".to_string(),
                    model_type: Some("text-generation".to_string()),
                    size: ModelSize::Medium,
                    parameters: BTreeMap::new(),
                },
                resources: ResourceSpec {
                    cpu: Some("2000m".to_string()),
                    memory: Some("8Gi".to_string()),
                    gpu: Some(1),
                    storage: None,
                    network_bandwidth: None,
                },
                scaling: ScalingSpec {
                    min_replicas: 2,
                    max_replicas: 4,
                    ..Default::default()
                },
                sla: Some(SlaSpec {
                    availability: Some(99.5),
                    p95_ms: Some(400),
                    ..Default::default()
                }),
                security: None,
                placement: None,
            },
            status: None,
        }
    }

    fn node_observation(name: &str) -> NodeObservation {
        NodeObservation {
            name: name.to_string(),
            capacity: ResourceCapacity {
                cpu: 8.0,
                memory: 64.0 * GIB,
                gpu: 2,
                storage: 0.0,
            },
            allocatable: ResourceCapacity {
                cpu: 8.0,
                memory: 64.0 * GIB,
                gpu: 2,
                storage: 0.0,
            },
            ..Default::default()
        }
    }

    fn resource_manager(nodes: Vec<NodeObservation>) -> Arc<ResourceManager> {
        let cache = Arc::new(CapacityCache::new());
        cache.apply_observations(nodes);
        Arc::new(ResourceManager::new(
            cache,
            PlacementEngine::default(),
            ResourceManagerConfig::default(),
        ))
    }

    fn registry_resolving(image: &str) -> MockModelRegistry {
        let image = image.to_string();
        let mut registry = MockModelRegistry::new();
        registry.expect_resolve().returning(move |_, _| {
            Ok(ResolvedModel {
                image: image.clone(),
                hints: None,
            })
        });
        registry
    }

    fn context(
        platform: MockPlatformClient,
        registry: MockModelRegistry,
        resources: Arc<ResourceManager>,
    ) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(platform),
            Arc::new(registry),
            resources,
            ReconcilerConfig::default(),
        ))
    }

    fn ready_deployment(workload: &LLMWorkload, image: &str, ready: i32) -> Deployment {
        let resources = resource_manager(vec![]);
        let requirements = resources.size(&workload.spec);
        let mut deployment = children::build_deployment(workload, &requirements, image);
        deployment.status = Some(DeploymentStatus {
            replicas: Some(workload.spec.scaling.min_replicas),
            ready_replicas: Some(ready),
            ..Default::default()
        });
        deployment
    }

    // =========================================================================
    // Story: Happy Path (end-to-end scenario 1)
    // =========================================================================

    /// Story: a fresh workload gets all three children and a Progressing
    /// status within one reconcile
    #[tokio::test]
    async fn story_fresh_workload_creates_children() {
        let workload = Arc::new(sample_workload());

        let mut platform = MockPlatformClient::new();
        platform
            .expect_get_config_map()
            .with(eq("inference"), eq("llama-config"))
            .times(1)
            .returning(|_, _| Ok(None));
        platform
            .expect_apply_config_map()
            .times(1)
            .returning(|_| Ok(()));
        platform
            .expect_get_deployment()
            .with(eq("inference"), eq("llama"))
            .times(1)
            .returning(|_, _| Ok(None));
        platform
            .expect_apply_deployment()
            .withf(|d| {
                d.spec.as_ref().and_then(|s| s.replicas) == Some(2)
                    && d.metadata.owner_references.is_some()
            })
            .times(1)
            .returning(|_| Ok(()));
        platform
            .expect_get_service()
            .with(eq("inference"), eq("llama"))
            .times(1)
            .returning(|_, _| Ok(None));
        platform.expect_apply_service().times(1).returning(|_| Ok(()));
        platform
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == WorkloadPhase::Progressing
                    && status
                        .condition_of(conditions::READY)
                        .map(|c| c.status == ConditionStatus::False)
                        .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let resources = resource_manager(vec![node_observation("node-a")]);
        let ctx = context(platform, registry_resolving("registry/llama:v1"), resources.clone());

        let action = reconcile(workload, ctx).await.expect("reconcile succeeds");
        assert_eq!(
            action,
            Action::requeue(Duration::from_secs(30)),
            "healthy workloads requeue on the reconcile interval"
        );

        // The allocation landed in the cache with the sized envelope
        let allocation = resources
            .cache()
            .allocation_for("inference/llama")
            .expect("allocation recorded");
        assert_eq!(allocation.node_name, "node-a");
        assert!((allocation.resources.cpu - 2.4).abs() < 1e-9);
        assert_eq!(allocation.resources.memory, 12.0 * GIB);
        assert_eq!(allocation.resources.gpu, 1);
    }

    /// Story: the workload reaches Running once every replica is ready
    #[tokio::test]
    async fn story_workload_runs_when_replicas_ready() {
        let workload = Arc::new(sample_workload());
        let live = ready_deployment(&workload, "registry/llama:v1", 2);

        let mut platform = MockPlatformClient::new();
        let cm = children::build_config_map(&workload);
        platform
            .expect_get_config_map()
            .returning(move |_, _| Ok(Some(cm.clone())));
        platform
            .expect_get_deployment()
            .returning(move |_, _| Ok(Some(live.clone())));
        let svc = children::build_service(&workload);
        platform
            .expect_get_service()
            .returning(move |_, _| Ok(Some(svc.clone())));
        platform
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == WorkloadPhase::Running
                    && status.ready_replicas == Some(2)
                    && status
                        .condition_of(conditions::READY)
                        .map(|c| c.status == ConditionStatus::True && c.reason == "DeploymentReady")
                        .unwrap_or(false)
                    && status
                        .endpoints
                        .contains(&"http://llama.inference.svc.cluster.local".to_string())
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let resources = resource_manager(vec![node_observation("node-a")]);
        let ctx = context(platform, registry_resolving("registry/llama:v1"), resources);

        reconcile(workload, ctx).await.expect("reconcile succeeds");
    }

    // =========================================================================
    // Story: Reconcile Idempotence
    // =========================================================================

    /// Story: reconciling an unchanged workload produces no writes
    ///
    /// The live children match the desired ones and the status matches the
    /// computed one, so the second pass is read-only. Any apply or patch
    /// would trip the mock.
    #[tokio::test]
    async fn story_unchanged_workload_produces_no_writes() {
        let mut workload = sample_workload();
        let live = ready_deployment(&workload, "registry/llama:v1", 2);

        let resources = resource_manager(vec![node_observation("node-a")]);
        // Pre-existing allocation, as after a previous reconcile
        let (allocation, _) = resources
            .ensure_allocation(&workload)
            .expect("allocation succeeds");

        // Status exactly as the previous pass computed it
        workload.status = Some(desired_status(&workload, Some(&live), Some(&allocation)));
        let workload = Arc::new(workload);

        let mut platform = MockPlatformClient::new();
        let cm = children::build_config_map(&workload);
        platform
            .expect_get_config_map()
            .times(1)
            .returning(move |_, _| Ok(Some(cm.clone())));
        platform
            .expect_get_deployment()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        let svc = children::build_service(&workload);
        platform
            .expect_get_service()
            .times(1)
            .returning(move |_, _| Ok(Some(svc.clone())));
        // No apply_* and no patch_status expectations: any write panics

        let ctx = context(platform, registry_resolving("registry/llama:v1"), resources);
        reconcile(workload, ctx).await.expect("reconcile succeeds");
    }

    // =========================================================================
    // Story: Model Not Found (end-to-end scenario 2)
    // =========================================================================

    /// Story: an unknown model fails the workload without creating children
    #[tokio::test]
    async fn story_unknown_model_fails_workload() {
        let workload = Arc::new(sample_workload());

        let mut registry = MockModelRegistry::new();
        registry
            .expect_resolve()
            .returning(|name, version| Err(Error::model_not_found(name, version)));

        let mut platform = MockPlatformClient::new();
        platform
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == WorkloadPhase::Failed
                    && status
                        .condition_of(conditions::READY)
                        .map(|c| {
                            c.status == ConditionStatus::False && c.reason == "ModelNotFound"
                        })
                        .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        // No get/apply for any child: creating children would trip the mock

        let resources = resource_manager(vec![node_observation("node-a")]);
        let ctx = context(platform, registry, resources.clone());

        let action = reconcile(workload, ctx).await.expect("terminal, not retried");
        assert_eq!(action, Action::await_change());

        // No allocation was recorded either
        assert!(resources.cache().allocation_for("inference/llama").is_none());
    }

    // =========================================================================
    // Story: Unschedulable (end-to-end scenario 3)
    // =========================================================================

    /// Story: no feasible node sets Progressing=False/Unschedulable and
    /// requeues with backoff
    #[tokio::test]
    async fn story_unschedulable_workload_requeues() {
        let workload = Arc::new(sample_workload());

        let mut platform = MockPlatformClient::new();
        platform
            .expect_patch_status()
            .withf(|_, _, status| {
                status
                    .condition_of(conditions::PROGRESSING)
                    .map(|c| c.status == ConditionStatus::False && c.reason == "Unschedulable")
                    .unwrap_or(false)
                    && status.phase != WorkloadPhase::Failed
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        // Empty cluster: nothing is feasible
        let resources = resource_manager(vec![]);
        let ctx = context(
            platform,
            registry_resolving("registry/llama:v1"),
            resources,
        );

        let err = reconcile(workload.clone(), ctx.clone())
            .await
            .expect_err("retryable error propagates");
        assert!(matches!(err, Error::NoFeasibleNode(_)));

        // Backoff grows exponentially from the base
        assert_eq!(
            error_policy(workload.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(1))
        );
        assert_eq!(
            error_policy(workload.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(
            error_policy(workload, &err, ctx),
            Action::requeue(Duration::from_secs(4))
        );
    }

    #[tokio::test]
    async fn story_backoff_is_capped() {
        let workload = Arc::new(sample_workload());
        let platform = MockPlatformClient::new();
        let ctx = context(
            platform,
            MockModelRegistry::new(),
            resource_manager(vec![]),
        );

        let err = Error::no_feasible_node("still full");
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let Some(requeue) = action_delay(&error_policy(workload.clone(), &err, ctx.clone()))
            {
                last = requeue;
            }
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    /// Extract the requeue delay from an Action by comparing against known
    /// delays (Action's internals are opaque)
    fn action_delay(action: &Action) -> Option<Duration> {
        for secs in [1u64, 2, 4, 8, 16, 32, 60] {
            if *action == Action::requeue(Duration::from_secs(secs)) {
                return Some(Duration::from_secs(secs));
            }
        }
        None
    }

    // =========================================================================
    // Story: Ownership Conflict
    // =========================================================================

    /// Story: a foreign deployment is never adopted
    #[tokio::test]
    async fn story_foreign_deployment_is_not_adopted() {
        let workload = Arc::new(sample_workload());

        let mut platform = MockPlatformClient::new();
        let cm = children::build_config_map(&workload);
        platform
            .expect_get_config_map()
            .returning(move |_, _| Ok(Some(cm.clone())));
        // A deployment with the right name but no owner reference
        platform.expect_get_deployment().returning(|_, _| {
            Ok(Some(Deployment {
                metadata: kube::api::ObjectMeta {
                    name: Some("llama".to_string()),
                    namespace: Some("inference".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        });
        platform
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == WorkloadPhase::Failed
                    && status
                        .condition_of(conditions::READY)
                        .map(|c| c.reason == "OwnedByOther")
                        .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let resources = resource_manager(vec![node_observation("node-a")]);
        let ctx = context(platform, registry_resolving("registry/llama:v1"), resources);

        let action = reconcile(workload, ctx).await.expect("terminal");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Story: Deletion (end-to-end scenario 5)
    // =========================================================================

    /// Story: children are deleted in reverse dependency order, the
    /// allocation is released, and the finalizer goes last
    #[tokio::test]
    async fn story_deletion_tears_down_in_order() {
        let mut workload = sample_workload();
        workload.metadata.deletion_timestamp = Some(Time(Utc::now()));
        workload.status = Some(LLMWorkloadStatus::with_phase(WorkloadPhase::Running));
        let workload = Arc::new(workload);

        let resources = resource_manager(vec![node_observation("node-a")]);
        resources
            .ensure_allocation(&workload)
            .expect("allocation exists before deletion");

        let mut platform = MockPlatformClient::new();
        let mut seq = Sequence::new();
        platform
            .expect_patch_status()
            .withf(|_, _, status| status.phase == WorkloadPhase::Terminating)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        platform
            .expect_delete_service()
            .with(eq("inference"), eq("llama"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        platform
            .expect_delete_deployment()
            .with(eq("inference"), eq("llama"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        platform
            .expect_delete_config_map()
            .with(eq("inference"), eq("llama-config"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        platform
            .expect_remove_finalizer()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let ctx = context(platform, MockModelRegistry::new(), resources.clone());

        let action = reconcile(workload, ctx).await.expect("teardown succeeds");
        assert_eq!(action, Action::await_change());

        // The allocation was released back to the cache
        assert!(resources.cache().allocation_for("inference/llama").is_none());
        let node = resources.cache().snapshot().node("node-a").cloned().unwrap();
        assert_eq!(node.used, ResourceCapacity::default());
    }

    /// Story: a failed child delete keeps the finalizer in place
    ///
    /// The workload record must never disappear while owned children still
    /// exist; the delete error propagates and the finalizer survives.
    #[tokio::test]
    async fn story_failed_delete_keeps_finalizer() {
        let mut workload = sample_workload();
        workload.metadata.deletion_timestamp = Some(Time(Utc::now()));
        workload.status = Some(LLMWorkloadStatus::with_phase(WorkloadPhase::Terminating));
        let workload = Arc::new(workload);

        let mut platform = MockPlatformClient::new();
        platform.expect_delete_service().returning(|_, _| Ok(()));
        platform
            .expect_delete_deployment()
            .returning(|_, _| Err(Error::timeout("deployment delete exceeded deadline")));
        // remove_finalizer must NOT be called: no expectation set

        let ctx = context(platform, MockModelRegistry::new(), resource_manager(vec![]));

        let err = reconcile(workload, ctx).await.expect_err("delete failed");
        assert!(err.is_retryable());
    }

    // =========================================================================
    // Story: Finalizer Attachment
    // =========================================================================

    #[tokio::test]
    async fn story_finalizer_is_attached_on_first_sight() {
        let mut workload = sample_workload();
        workload.metadata.finalizers = None;
        let workload = Arc::new(workload);

        let mut platform = MockPlatformClient::new();
        platform.expect_ensure_finalizer().times(1).returning(|_| Ok(()));
        platform.expect_get_config_map().returning(|_, _| Ok(None));
        platform.expect_apply_config_map().returning(|_| Ok(()));
        platform.expect_get_deployment().returning(|_, _| Ok(None));
        platform.expect_apply_deployment().returning(|_| Ok(()));
        platform.expect_get_service().returning(|_, _| Ok(None));
        platform.expect_apply_service().returning(|_| Ok(()));
        platform.expect_patch_status().returning(|_, _, _| Ok(()));

        let resources = resource_manager(vec![node_observation("node-a")]);
        let ctx = context(platform, registry_resolving("img:v1"), resources);

        reconcile(workload, ctx).await.expect("reconcile succeeds");
    }

    // =========================================================================
    // Story: State-Machine Monotonicity
    // =========================================================================

    /// Story: Ready flips to True only when every desired replica is ready
    #[test]
    fn story_ready_requires_full_replica_count() {
        let workload = sample_workload();

        let partially_ready = ready_deployment(&workload, "img:v1", 1);
        let status = desired_status(&workload, Some(&partially_ready), None);
        assert_eq!(status.phase, WorkloadPhase::Progressing);
        assert_eq!(
            status.condition_of(conditions::READY).unwrap().status,
            ConditionStatus::False
        );

        let fully_ready = ready_deployment(&workload, "img:v1", 2);
        let status = desired_status(&workload, Some(&fully_ready), None);
        assert_eq!(status.phase, WorkloadPhase::Running);
        assert_eq!(
            status.condition_of(conditions::READY).unwrap().status,
            ConditionStatus::True
        );
    }

    /// Story: an absent deployment can never be Running
    #[test]
    fn story_no_deployment_means_progressing() {
        let workload = sample_workload();
        let status = desired_status(&workload, None, None);
        assert_eq!(status.phase, WorkloadPhase::Progressing);
    }

    /// Story: unchanged conditions keep their transition timestamps
    #[test]
    fn story_stable_conditions_keep_timestamps() {
        let mut workload = sample_workload();
        let deployment = ready_deployment(&workload, "img:v1", 2);

        let first = desired_status(&workload, Some(&deployment), None);
        workload.status = Some(first.clone());

        let second = desired_status(&workload, Some(&deployment), None);
        assert_eq!(first, second, "an idle workload's status is stable");
    }
}
