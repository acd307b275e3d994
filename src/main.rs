//! kiln operator - LLM workload orchestration for Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kiln::crd::LLMWorkload;
use kiln::orchestrator::{Orchestrator, OrchestratorConfig};
use kiln::registry::{CachingRegistry, FileModelRegistry, ModelRegistry};

/// Exit code for fatal configuration errors
const EXIT_CONFIG: i32 = 1;
/// Exit code when the platform API is unreachable at startup
const EXIT_PLATFORM: i32 = 2;

/// kiln - Kubernetes operator for LLM inference workloads
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about, long_about = None)]
struct Cli {
    /// Generate the LLMWorkload CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file; empty uses in-cluster credentials
    #[arg(long, default_value = "")]
    kubeconfig: String,

    /// Namespace to watch; empty watches all namespaces
    #[arg(long, default_value = "")]
    namespace: String,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, default_value_t = kiln::DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Port for the health endpoint
    #[arg(long, default_value_t = kiln::DEFAULT_HEALTH_PORT)]
    health_port: u16,

    /// Run leader election; only the leader reconciles
    #[arg(long, default_value_t = false)]
    leader_election: bool,

    /// Name of the leader election lease
    #[arg(long, default_value = "kiln-leader")]
    leader_lock_name: String,

    /// Periodic reconcile interval (e.g. "30s", "2m")
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    reconcile_interval: Duration,

    /// Maximum number of concurrently reconciled workloads
    #[arg(long, default_value_t = 4)]
    max_concurrent_reconciles: usize,

    /// Path to the YAML model catalog
    #[arg(long, env = "KILN_MODEL_CATALOG")]
    model_catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&LLMWorkload::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    // Model catalog is configuration: a broken catalog is a fatal config
    // error, not a runtime condition
    let registry: Arc<dyn ModelRegistry> = match &cli.model_catalog {
        Some(path) => match FileModelRegistry::load(path) {
            Ok(catalog) => {
                tracing::info!(path = ?path, models = catalog.len(), "loaded model catalog");
                Arc::new(CachingRegistry::new(catalog))
            }
            Err(e) => {
                eprintln!("fatal: cannot load model catalog {path:?}: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        },
        None => {
            tracing::warn!("no model catalog configured; every model resolves to NotFound");
            Arc::new(CachingRegistry::new(FileModelRegistry::empty()))
        }
    };

    let client = match build_client(&cli.kubeconfig).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("fatal: cannot build Kubernetes client: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // The operator is useless without the platform; fail fast with a
    // distinct exit code so init systems can tell the cases apart
    if let Err(e) = probe_platform(&client).await {
        eprintln!("fatal: platform API unreachable: {e}");
        std::process::exit(EXIT_PLATFORM);
    }

    if let Err(e) = ensure_crd_installed(&client).await {
        eprintln!("fatal: cannot install LLMWorkload CRD: {e}");
        std::process::exit(EXIT_PLATFORM);
    }

    let config = OrchestratorConfig {
        namespace: (!cli.namespace.is_empty()).then_some(cli.namespace.clone()),
        metrics_port: cli.metrics_port,
        health_port: cli.health_port,
        leader_election: cli.leader_election,
        leader_lock_name: cli.leader_lock_name.clone(),
        reconcile_interval: cli.reconcile_interval,
        max_concurrent_reconciles: cli.max_concurrent_reconciles,
        ..Default::default()
    };

    tracing::info!(
        namespace = %if cli.namespace.is_empty() { "<all>" } else { &cli.namespace },
        leader_election = cli.leader_election,
        "kiln orchestrator starting"
    );

    Orchestrator::new(client, registry, config).run().await?;

    tracing::info!("kiln orchestrator shut down");
    Ok(())
}

/// Build a Kubernetes client from a kubeconfig path or ambient credentials
async fn build_client(kubeconfig: &str) -> anyhow::Result<Client> {
    if kubeconfig.is_empty() {
        return Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("no usable kubeconfig or in-cluster config: {e}"));
    }

    let config_file = kube::config::Kubeconfig::read_from(kubeconfig)
        .map_err(|e| anyhow::anyhow!("cannot read kubeconfig {kubeconfig}: {e}"))?;
    let config = kube::Config::from_custom_kubeconfig(
        config_file,
        &kube::config::KubeConfigOptions::default(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("invalid kubeconfig {kubeconfig}: {e}"))?;
    Client::try_from(config).map_err(|e| anyhow::anyhow!("cannot build client: {e}"))
}

/// Startup probe: one cheap node list against the platform API
async fn probe_platform(client: &Client) -> anyhow::Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    tokio::time::timeout(
        Duration::from_secs(10),
        nodes.list(&ListParams::default().limit(1)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("node list timed out"))?
    .map_err(|e| anyhow::anyhow!("node list failed: {e}"))?;
    Ok(())
}

/// Install (or update) the LLMWorkload CRD via server-side apply
///
/// The operator installs its own CRD on startup so the CRD version always
/// matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("kiln-controller").force();

    tracing::info!("installing LLMWorkload CRD");
    crds.patch(
        "llmworkloads.kiln.dev",
        &params,
        &Patch::Apply(&LLMWorkload::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install LLMWorkload CRD: {}", e))?;

    Ok(())
}
