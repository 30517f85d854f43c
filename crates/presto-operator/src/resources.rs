//! Kubernetes Resource Builders
//!
//! This module generates the Kubernetes objects a Presto cluster is made of
//! (services, config maps, replica sets, the worker autoscaler) from a
//! `Presto` resource and its assigned cluster uuid.

use crate::crd::{Presto, PrestoSpec};
use crate::error::{OperatorError, Result};
use crate::naming::{ClusterNames, ResourceKind, Role};
use crate::properties::{
    self, CoordinatorPorts, HttpsKeyPair, CATALOG_FILE_SUFFIX, HTTPS_SECRET_PATH,
    SHUTDOWN_SCRIPT_KEY,
};
use crate::quantity::parse_quantity;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapProjection, Container, ContainerPort, ExecAction, KeyToPath, Lifecycle,
    LifecycleHandler, PodSpec, PodTemplateSpec, ProjectedVolumeSource, ResourceRequirements,
    SecretProjection, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Name of the single port on the external service
pub const SERVICE_PORT_NAME: &str = "presto-coordinator-port";

/// Autoscaler bounds, all required once autoscaling is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscalerTargets {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_cpu_utilization_percentage: i32,
}

impl AutoscalerTargets {
    pub fn from_spec(spec: &PrestoSpec) -> Result<Self> {
        let autoscaling = &spec.worker.autoscaling;
        let targets = Self {
            min_replicas: autoscaling
                .min_replicas
                .ok_or(OperatorError::MissingAutoscalingField("MinReplicas"))?,
            max_replicas: autoscaling
                .max_replicas
                .ok_or(OperatorError::MissingAutoscalingField("MaxReplicas"))?,
            target_cpu_utilization_percentage: autoscaling
                .target_cpu_utilization_percentage
                .ok_or(OperatorError::MissingAutoscalingField(
                    "TargetCPUUtilizationPercentage",
                ))?,
        };

        if targets.min_replicas > targets.max_replicas {
            return Err(OperatorError::InvalidConfig(format!(
                "minReplicas ({}) cannot exceed maxReplicas ({})",
                targets.min_replicas, targets.max_replicas
            )));
        }
        if !(1..=100).contains(&targets.target_cpu_utilization_percentage) {
            return Err(OperatorError::InvalidConfig(format!(
                "targetCPUUtilizationPercentage ({}) must be between 1 and 100",
                targets.target_cpu_utilization_percentage
            )));
        }
        Ok(targets)
    }

    /// Whether a live autoscaler already enforces these bounds
    pub fn matches(&self, hpa: &HorizontalPodAutoscaler) -> bool {
        hpa.spec.as_ref().is_some_and(|spec| {
            spec.max_replicas == self.max_replicas
                && spec.min_replicas == Some(self.min_replicas)
                && spec.target_cpu_utilization_percentage
                    == Some(self.target_cpu_utilization_percentage)
        })
    }

    /// Copy these bounds onto `hpa`, keeping everything else
    pub fn apply_to(&self, hpa: &mut HorizontalPodAutoscaler) {
        if let Some(spec) = hpa.spec.as_mut() {
            spec.min_replicas = Some(self.min_replicas);
            spec.max_replicas = self.max_replicas;
            spec.target_cpu_utilization_percentage = Some(self.target_cpu_utilization_percentage);
        }
    }
}

/// Builder for generating Kubernetes resources from a Presto resource
pub struct ResourceBuilder<'a> {
    presto: &'a Presto,
    names: ClusterNames,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder for a cluster with an assigned uuid
    pub fn new(presto: &'a Presto, uuid: &str) -> Result<Self> {
        let name = presto
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("presto name is required".to_string()))?;

        if uuid.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "cluster uuid has not been assigned".to_string(),
            ));
        }

        let namespace = presto.namespace().unwrap_or_else(|| "default".to_string());

        Ok(Self {
            presto,
            names: ClusterNames::new(name, uuid),
            namespace,
        })
    }

    pub fn names(&self) -> &ClusterNames {
        &self.names
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn spec(&self) -> &PrestoSpec {
        &self.presto.spec
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "falarica.io/v1alpha1".to_string(),
            kind: "Presto".to_string(),
            name: self.names.cluster_name().to_string(),
            uid: self.presto.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, kind: ResourceKind) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.names.name(kind)),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.names.labels(kind)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Headless service giving the coordinator a stable DNS name
    pub fn build_discovery_service(&self) -> Service {
        let ports = CoordinatorPorts::for_spec(self.spec());
        Service {
            metadata: self.metadata(ResourceKind::DiscoveryService),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.names.base_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: ports.http,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Service exposing the coordinator to clients
    pub fn build_external_service(&self) -> Result<Service> {
        let service = &self.spec().service;
        let service_type = service.type_.clone().unwrap_or_else(|| "ClusterIP".to_string());
        if service_type == "ExternalName" {
            return Err(OperatorError::InvalidConfig(
                "service type ExternalName is not supported".to_string(),
            ));
        }

        let port = service.port.unwrap_or(properties::PRESTO_PORT);
        let node_port = if service_type == "ClusterIP" {
            None
        } else {
            service.node_port
        };

        let non_empty = |v: &Vec<String>| if v.is_empty() { None } else { Some(v.clone()) };

        Ok(Service {
            metadata: self.metadata(ResourceKind::ExternalService),
            spec: Some(ServiceSpec {
                type_: Some(service_type),
                selector: Some(self.names.pod_selector(Role::Coordinator)),
                ports: Some(vec![ServicePort {
                    name: Some(SERVICE_PORT_NAME.to_string()),
                    port,
                    node_port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                cluster_ip: service.cluster_ip.clone(),
                external_ips: non_empty(&service.external_ips),
                session_affinity: service.session_affinity.clone(),
                load_balancer_ip: service.load_balancer_ip.clone(),
                load_balancer_source_ranges: non_empty(&service.load_balancer_source_ranges),
                external_traffic_policy: service.external_traffic_policy.clone(),
                health_check_node_port: service.health_check_node_port,
                publish_not_ready_addresses: service
                    .publish_not_ready_addresses
                    .then_some(true),
                session_affinity_config: service.session_affinity_config.clone(),
                ip_families: non_empty(&service.ip_families),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn config_map(&self, kind: ResourceKind, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: self.metadata(kind),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Configuration bundle mounted into the coordinator
    pub fn build_coordinator_config(&self) -> Result<ConfigMap> {
        let data = properties::coordinator_bundle(self.spec(), &self.names)?;
        Ok(self.config_map(ResourceKind::CoordinatorConfig, data))
    }

    /// Configuration bundle mounted into every worker
    pub fn build_worker_config(&self) -> Result<ConfigMap> {
        let data = properties::worker_bundle(self.spec(), &self.names)?;
        Ok(self.config_map(ResourceKind::WorkerConfig, data))
    }

    /// Generated catalog files
    pub fn build_catalog_config(&self) -> ConfigMap {
        let data = properties::catalog_bundle(&self.spec().catalogs);
        self.config_map(ResourceKind::CatalogConfig, data)
    }

    /// Replica set running the single coordinator
    pub fn build_coordinator_replica_set(&self) -> Result<ReplicaSet> {
        self.build_replica_set(Role::Coordinator, 1)
    }

    /// Replica set running the workers, sized from the spec count
    pub fn build_worker_replica_set(&self) -> Result<ReplicaSet> {
        self.build_replica_set(Role::Worker, self.spec().worker.count)
    }

    fn build_replica_set(&self, role: Role, replicas: i32) -> Result<ReplicaSet> {
        let kind = role.replica_set();
        let labels = self.names.labels(kind);
        let pod_spec = self.build_pod_spec(role)?;

        Ok(ReplicaSet {
            metadata: self.metadata(kind),
            spec: Some(ReplicaSetSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Autoscaler targeting the worker replica set
    pub fn build_autoscaler(&self) -> Result<HorizontalPodAutoscaler> {
        let targets = AutoscalerTargets::from_spec(self.spec())?;
        Ok(HorizontalPodAutoscaler {
            metadata: self.metadata(ResourceKind::Autoscaler),
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: Some(targets.min_replicas),
                max_replicas: targets.max_replicas,
                target_cpu_utilization_percentage: Some(targets.target_cpu_utilization_percentage),
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "ReplicaSet".to_string(),
                    name: self.names.name(ResourceKind::WorkerReplicaSet),
                },
            }),
            ..Default::default()
        })
    }

    fn build_resources(&self, role: Role) -> Result<ResourceRequirements> {
        let node = self.spec().node(role);
        let cpu_request = node.cpu_request.as_deref().unwrap_or(&node.cpu_limit);
        for quantity in [&node.cpu_limit, &node.memory_limit, cpu_request] {
            parse_quantity(quantity)?;
        }

        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity(node.cpu_limit.clone()));
        limits.insert("memory".to_string(), Quantity(node.memory_limit.clone()));

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu_request.to_string()));

        Ok(ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        })
    }

    fn build_pod_spec(&self, role: Role) -> Result<PodSpec> {
        let spec = self.spec();
        let presto_path = spec.presto_path().trim_end_matches('/').to_string();
        let container_name = self.names.name(role.container());

        let mut volumes = vec![self.config_volume(role), self.catalog_volume()];
        let mut mounts = vec![
            VolumeMount {
                name: self.names.name(role.config_volume()),
                mount_path: presto_path.clone(),
                ..Default::default()
            },
            VolumeMount {
                name: self.names.name(ResourceKind::CatalogVolume),
                mount_path: spec.catalog_path(),
                ..Default::default()
            },
        ];

        if role == Role::Coordinator {
            if let Some(key_pair) = HttpsKeyPair::from_spec(spec)? {
                let name = self.names.name(ResourceKind::HttpsSecretVolume);
                volumes.push(Volume {
                    name: name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(key_pair.secret_name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                mounts.push(VolumeMount {
                    name,
                    mount_path: HTTPS_SECRET_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }

        for extra in &spec.volumes {
            volumes.push(extra.volume.clone());
            mounts.push(VolumeMount {
                name: extra.volume.name.clone(),
                mount_path: extra.mount_path.clone(),
                read_only: extra.read_only.then_some(true),
                sub_path: extra.sub_path.clone(),
                mount_propagation: extra.mount_propagation.clone(),
                sub_path_expr: extra.sub_path_expr.clone(),
                ..Default::default()
            });
        }

        let ports = CoordinatorPorts::for_spec(spec);
        let mut container_ports = vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: match role {
                Role::Coordinator => ports.http,
                Role::Worker => properties::PRESTO_PORT,
            },
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if let (Role::Coordinator, Some(https)) = (role, ports.https) {
            container_ports.push(ContainerPort {
                name: Some("https".to_string()),
                container_port: https,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        let lifecycle = match role {
            Role::Coordinator => None,
            Role::Worker => Some(Lifecycle {
                pre_stop: Some(LifecycleHandler {
                    exec: Some(ExecAction {
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            format!("{}/{}", presto_path, SHUTDOWN_SCRIPT_KEY),
                        ]),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };

        let container = Container {
            name: container_name.clone(),
            image: Some(spec.image().to_string()),
            resources: Some(self.build_resources(role)?),
            ports: Some(container_ports),
            volume_mounts: Some(mounts),
            lifecycle,
            ..Default::default()
        };

        let mut pod_spec = PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        };

        match role {
            Role::Coordinator => {
                pod_spec.hostname = Some(container_name);
                pod_spec.subdomain = Some(self.names.name(ResourceKind::DiscoveryService));
            }
            Role::Worker => {
                pod_spec.termination_grace_period_seconds =
                    Some(spec.worker.termination_grace_period());
            }
        }

        Ok(pod_spec)
    }

    fn config_volume(&self, role: Role) -> Volume {
        Volume {
            name: self.names.name(role.config_volume()),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: self.names.name(role.config()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Generated catalogs plus every secret-backed catalog, in one directory
    fn catalog_volume(&self) -> Volume {
        let mut sources = vec![VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: self.names.name(ResourceKind::CatalogConfig),
                ..Default::default()
            }),
            ..Default::default()
        }];

        for secret in &self.spec().catalogs.catalog_secrets {
            sources.push(VolumeProjection {
                secret: Some(SecretProjection {
                    name: secret.secret_name.clone(),
                    items: Some(vec![KeyToPath {
                        key: secret.secret_key.clone(),
                        path: format!("{}{}", secret.secret_key, CATALOG_FILE_SUFFIX),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Volume {
            name: self.names.name(ResourceKind::CatalogVolume),
            projected: Some(ProjectedVolumeSource {
                sources: Some(sources),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
