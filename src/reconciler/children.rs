//! Desired child objects for an LLMWorkload
//!
//! Builders for the three objects a workload owns: the ConfigMap carrying
//! model identity and parameters, the Deployment running the inference
//! server, and the ClusterIP Service exposing it. Every child carries a
//! controller owner reference back to the workload; the reconciler refuses
//! to touch children lacking it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements as K8sResourceRequirements, Service, ServicePort,
    ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::capacity::GPU_RESOURCE;
use crate::crd::LLMWorkload;
use crate::resources::{quantity, ResourceRequirements};

/// HTTP serving port inside the container
pub const HTTP_PORT: i32 = 8080;
/// gRPC serving port inside the container
pub const GRPC_PORT: i32 = 9090;
/// Mount path for the model ConfigMap
const CONFIG_MOUNT_PATH: &str = "/etc/config";

/// Label linking a child object back to its workload
pub const WORKLOAD_LABEL: &str = "kiln.dev/workload";
/// Label carrying the model name
pub const MODEL_LABEL: &str = "kiln.dev/model";
/// Label carrying the model version
pub const VERSION_LABEL: &str = "kiln.dev/version";

/// Name of the ConfigMap owned by a workload
pub fn config_map_name(workload_name: &str) -> String {
    format!("{workload_name}-config")
}

fn workload_name(workload: &LLMWorkload) -> String {
    workload.metadata.name.clone().unwrap_or_default()
}

fn workload_namespace(workload: &LLMWorkload) -> String {
    workload
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

fn labels(workload: &LLMWorkload) -> BTreeMap<String, String> {
    let name = workload_name(workload);
    BTreeMap::from([
        ("app".to_string(), name.clone()),
        (WORKLOAD_LABEL.to_string(), name),
        (MODEL_LABEL.to_string(), workload.spec.model.name.clone()),
        (
            VERSION_LABEL.to_string(),
            workload.spec.model.effective_version().to_string(),
        ),
    ])
}

fn selector_labels(workload: &LLMWorkload) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), workload_name(workload))])
}

fn owner_reference(workload: &LLMWorkload) -> Option<OwnerReference> {
    workload.controller_owner_ref(&())
}

/// Security hints forwarded to children as annotations
fn security_annotations(workload: &LLMWorkload) -> Option<BTreeMap<String, String>> {
    let security = workload.spec.security.as_ref()?;
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kiln.dev/encryption".to_string(),
        security.encryption.to_string(),
    );
    if let Some(level) = &security.compliance_level {
        annotations.insert("kiln.dev/compliance-level".to_string(), level.clone());
    }
    if let Some(classification) = &security.data_classification {
        annotations.insert(
            "kiln.dev/data-classification".to_string(),
            classification.clone(),
        );
    }
    Some(annotations)
}

fn child_meta(workload: &LLMWorkload, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(workload_namespace(workload)),
        labels: Some(labels(workload)),
        annotations: security_annotations(workload),
        owner_references: owner_reference(workload).map(|r| vec![r]),
        ..Default::default()
    }
}

/// True when the object carries a controller owner reference to the workload.
///
/// When both sides carry a UID the UIDs must match; objects created before
/// the workload's UID was known fall back to kind+name identity.
pub fn is_owned_by(meta: &ObjectMeta, workload: &LLMWorkload) -> bool {
    let Some(references) = meta.owner_references.as_ref() else {
        return false;
    };
    let name = workload_name(workload);
    let workload_uid = workload.metadata.uid.as_deref();

    references.iter().any(|r| {
        r.controller == Some(true)
            && r.kind == "LLMWorkload"
            && r.name == name
            && match (workload_uid, r.uid.as_str()) {
                (Some(expected), actual) if !actual.is_empty() => expected == actual,
                _ => true,
            }
    })
}

/// Build the ConfigMap carrying model identity and serving parameters
pub fn build_config_map(workload: &LLMWorkload) -> ConfigMap {
    let mut data = BTreeMap::from([
        ("model_name".to_string(), workload.spec.model.name.clone()),
        (
            "model_version".to_string(),
            workload.spec.model.effective_version().to_string(),
        ),
        (
            "model_type".to_string(),
            workload.spec.model.model_type.clone().unwrap_or_default(),
        ),
    ]);

    // Serving parameters are opaque to the orchestrator; project them as-is
    for (key, value) in &workload.spec.model.parameters {
        data.insert(key.clone(), value.clone());
    }

    ConfigMap {
        metadata: child_meta(workload, config_map_name(&workload_name(workload))),
        data: Some(data),
        ..Default::default()
    }
}

fn resource_list(cpu: f64, memory: f64, gpu: i64) -> BTreeMap<String, Quantity> {
    let mut list = BTreeMap::from([
        ("cpu".to_string(), Quantity(quantity::format_cpu(cpu))),
        (
            "memory".to_string(),
            Quantity(quantity::format_memory(memory)),
        ),
    ]);
    if gpu > 0 {
        list.insert(GPU_RESOURCE.to_string(), Quantity(gpu.to_string()));
    }
    list
}

fn http_probe(path: &str, initial_delay: i32, period: i32, timeout: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String("http".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(timeout),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn build_container(
    workload: &LLMWorkload,
    requirements: &ResourceRequirements,
    image: &str,
) -> Container {
    Container {
        name: "llm-server".to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: HTTP_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: GRPC_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(vec![
            EnvVar {
                name: "MODEL_NAME".to_string(),
                value: Some(workload.spec.model.name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "MODEL_VERSION".to_string(),
                value: Some(workload.spec.model.effective_version().to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "MODEL_TYPE".to_string(),
                value: Some(workload.spec.model.model_type.clone().unwrap_or_default()),
                ..Default::default()
            },
        ]),
        resources: Some(K8sResourceRequirements {
            requests: Some(resource_list(
                requirements.requested.cpu,
                requirements.requested.memory,
                requirements.requested.gpu,
            )),
            limits: Some(resource_list(
                requirements.limits.cpu,
                requirements.limits.memory,
                requirements.limits.gpu,
            )),
            ..Default::default()
        }),
        liveness_probe: Some(http_probe("/health", 30, 10, 5)),
        readiness_probe: Some(http_probe("/ready", 10, 5, 3)),
        volume_mounts: Some(vec![VolumeMount {
            name: "config".to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Build the Deployment running the inference server
pub fn build_deployment(
    workload: &LLMWorkload,
    requirements: &ResourceRequirements,
    image: &str,
) -> Deployment {
    let name = workload_name(workload);

    // Hard node-selector constraints are forwarded so the platform scheduler
    // enforces them too
    let mut node_selector = BTreeMap::new();
    if let Some(placement) = &workload.spec.placement {
        node_selector.extend(placement.node_selector.clone());
    }

    let mut tolerations: Vec<Toleration> = workload
        .spec
        .placement
        .as_ref()
        .map(|p| {
            p.tolerated_taints
                .iter()
                .map(|key| Toleration {
                    key: Some(key.clone()),
                    operator: Some("Exists".to_string()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default();
    if requirements.requested.gpu > 0 {
        tolerations.push(Toleration {
            key: Some(GPU_RESOURCE.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        });
    }

    Deployment {
        metadata: child_meta(workload, name.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(workload.spec.scaling.min_replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(workload)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(workload)),
                    annotations: security_annotations(workload),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![build_container(workload, requirements, image)],
                    volumes: Some(vec![Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config_map_name(&name)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    node_selector: (!node_selector.is_empty()).then_some(node_selector),
                    tolerations: (!tolerations.is_empty()).then_some(tolerations),
                    ..Default::default()
                }),
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                    max_surge: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ClusterIP Service exposing HTTP and gRPC
pub fn build_service(workload: &LLMWorkload) -> Service {
    Service {
        metadata: child_meta(workload, workload_name(workload)),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(workload)),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::String("http".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("grpc".to_string()),
                    port: GRPC_PORT,
                    target_port: Some(IntOrString::String("grpc".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster-local endpoints exposed once the Service exists
pub fn service_endpoints(workload: &LLMWorkload) -> Vec<String> {
    let name = workload_name(workload);
    let namespace = workload_namespace(workload);
    vec![
        format!("http://{name}.{namespace}.svc.cluster.local"),
        format!("grpc://{name}.{namespace}.svc.cluster.local:{GRPC_PORT}"),
    ]
}
