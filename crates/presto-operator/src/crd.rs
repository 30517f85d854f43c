//! Custom Resource Definition for the Presto Kubernetes Operator
//!
//! This module defines the `Presto` CRD that represents one distributed SQL
//! cluster: a single coordinator, a pool of workers that may be autoscaled,
//! and the catalog configuration they share.

use crate::naming::Role;
use k8s_openapi::api::core::v1::{SessionAffinityConfig, Volume};
use kube::CustomResource;
use regex::Regex;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, ObjectValidation, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Image used when `imageDetails.name` is not set
pub const DEFAULT_IMAGE: &str = "prestosql/presto:333";

/// Directory the generated configuration is mounted at when
/// `imageDetails.prestoPath` is not set
pub const DEFAULT_PRESTO_PATH: &str = "/etc/presto";

/// Grace period given to workers to drain running queries
pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 7200;

/// Regex for validating Kubernetes resource quantities (e.g., "4Gi", "500m", "1.5")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?((Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E)|([eE][-+]?[0-9]+))?$")
        .unwrap()
});

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Presto custom resource definition
///
/// Declares one Presto cluster. The operator watches these resources and
/// converges services, configuration bundles, replica sets and the worker
/// autoscaler toward the declaration.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "falarica.io",
    version = "v1alpha1",
    kind = "Presto",
    plural = "prestos",
    shortname = "presto",
    namespaced,
    status = "PrestoStatus",
    printcolumn = r#"{"name":"Coordinator", "type":"string", "jsonPath":".status.coordinatorAddress"}"#,
    printcolumn = r#"{"name":"ClusterState", "type":"string", "jsonPath":".status.clusterState"}"#,
    printcolumn = r#"{"name":"CoordinatorCPU", "type":"string", "jsonPath":".status.coordinatorCPU"}"#,
    printcolumn = r#"{"name":"WorkersCPU", "type":"string", "jsonPath":".status.workerCPU"}"#,
    printcolumn = r#"{"name":"DesiredWorkers", "type":"integer", "jsonPath":".status.desiredWorkers"}"#,
    printcolumn = r#"{"name":"CurrentWorkers", "type":"integer", "jsonPath":".status.currentWorkers"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PrestoSpec {
    /// Coordinator node settings
    #[validate(nested)]
    pub coordinator: CoordinatorSpec,

    /// Worker pool settings
    #[validate(nested)]
    pub worker: WorkerSpec,

    /// Catalogs made available to every node
    #[serde(default)]
    #[validate(nested)]
    pub catalogs: CatalogList,

    /// External service exposing the coordinator
    #[serde(default)]
    #[validate(nested)]
    pub service: PrestoServiceSpec,

    /// Container image and configuration path
    #[serde(default)]
    #[validate(nested)]
    pub image_details: ImageDetails,

    /// Extra files placed next to the generated configuration.
    /// Content here wins over generated files of the same name.
    #[serde(default)]
    pub additional_presto_prop_files: BTreeMap<String, String>,

    /// Extra volumes mounted into every Presto container
    #[serde(default)]
    #[validate(nested)]
    pub volumes: Vec<PrestoVolume>,
}

/// Resource and JVM settings shared by coordinator and workers
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Memory limit; the JVM heap is sized from it
    #[validate(custom(function = "validate_quantity"))]
    pub memory_limit: String,

    /// CPU limit
    #[validate(custom(function = "validate_quantity"))]
    pub cpu_limit: String,

    /// CPU request; defaults to the limit
    #[serde(default)]
    #[validate(custom(function = "validate_quantity"))]
    pub cpu_request: Option<String>,

    /// Text appended to the generated jvm.config
    #[serde(default, rename = "additionalJVMConfig")]
    pub additional_jvm_config: Option<String>,

    /// Extra entries for config.properties
    #[serde(default)]
    pub additional_props: BTreeMap<String, String>,
}

/// Coordinator settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub node: NodeSpec,

    /// Serve HTTPS in addition to plain HTTP
    #[serde(default)]
    pub https_enabled: bool,

    /// Secret holding the keystore
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub https_key_pair_secret_name: Option<String>,

    /// Key of the keystore inside the secret
    #[serde(default)]
    pub https_key_pair_secret_key: Option<String>,

    /// Keystore password
    #[serde(default)]
    pub https_key_pair_password: Option<String>,
}

/// Worker pool settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub node: NodeSpec,

    /// Seconds a worker gets to finish running queries on shutdown
    #[serde(default)]
    #[validate(range(min = 0, message = "terminationGracePeriodSeconds must not be negative"))]
    pub termination_grace_period_seconds: Option<i64>,

    /// Number of workers; ignored while autoscaling is enabled
    #[validate(range(min = 1, max = 10000, message = "count must be between 1 and 10000"))]
    pub count: i32,

    /// Worker autoscaling
    #[serde(default)]
    #[validate(nested)]
    pub autoscaling: AutoscalingSpec,
}

/// Horizontal autoscaling of the worker pool on CPU utilization
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_autoscaling_bounds"))]
pub struct AutoscalingSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    #[validate(range(min = 1, message = "minReplicas must be at least 1"))]
    pub min_replicas: Option<i32>,

    #[serde(default)]
    #[validate(range(min = 1, message = "maxReplicas must be at least 1"))]
    pub max_replicas: Option<i32>,

    #[serde(default, rename = "targetCPUUtilizationPercentage")]
    #[validate(range(
        min = 1,
        max = 100,
        message = "targetCPUUtilizationPercentage must be between 1 and 100"
    ))]
    pub target_cpu_utilization_percentage: Option<i32>,
}

fn validate_autoscaling_bounds(spec: &AutoscalingSpec) -> Result<(), ValidationError> {
    if let (Some(min), Some(max)) = (spec.min_replicas, spec.max_replicas) {
        if min > max {
            return Err(ValidationError::new("invalid_bounds").with_message(
                format!("minReplicas ({}) cannot exceed maxReplicas ({})", min, max).into(),
            ));
        }
    }
    Ok(())
}

/// Catalog definitions
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CatalogList {
    /// Catalog files kept in secrets
    #[serde(default)]
    #[validate(nested)]
    pub catalog_secrets: Vec<CatalogSecret>,

    /// Inline catalogs rendered into the catalog config map
    #[serde(default)]
    #[validate(nested)]
    pub catalog_spec: Vec<CatalogSpec>,
}

/// Inline catalog: file `<name>.properties` with one line per entry
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSpec {
    #[validate(length(min = 1, max = 253, message = "catalog name must be 1-253 characters"))]
    pub name: String,

    #[serde(default)]
    pub content: BTreeMap<String, String>,
}

/// Secret-backed catalog. The secret key is both the catalog name and the
/// file name (with `.properties` appended).
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSecret {
    #[validate(custom(function = "validate_k8s_name"))]
    pub secret_name: String,

    #[validate(length(min = 1, message = "secretKey is required"))]
    pub secret_key: String,
}

/// External service settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PrestoServiceSpec {
    /// Port exposed by the service; 8080 when unset
    #[serde(default)]
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: Option<i32>,

    /// Node port, used unless the service type is ClusterIP
    #[serde(default)]
    #[validate(range(min = 1, max = 65535, message = "nodePort must be between 1 and 65535"))]
    pub node_port: Option<i32>,

    #[serde(default, rename = "type")]
    #[validate(custom(function = "validate_service_type"))]
    pub type_: Option<String>,

    #[serde(default, rename = "clusterIP")]
    pub cluster_ip: Option<String>,

    #[serde(default, rename = "externalIPs")]
    pub external_ips: Vec<String>,

    #[serde(default)]
    pub session_affinity: Option<String>,

    #[serde(default, rename = "loadBalancerIP")]
    pub load_balancer_ip: Option<String>,

    #[serde(default)]
    pub load_balancer_source_ranges: Vec<String>,

    #[serde(default)]
    pub external_name: Option<String>,

    #[serde(default)]
    pub external_traffic_policy: Option<String>,

    #[serde(default)]
    pub health_check_node_port: Option<i32>,

    #[serde(default)]
    pub publish_not_ready_addresses: bool,

    #[serde(default)]
    #[schemars(skip)]
    pub session_affinity_config: Option<SessionAffinityConfig>,

    #[serde(default)]
    pub ip_families: Vec<String>,
}

/// Validate service type
fn validate_service_type(service_type: &str) -> Result<(), ValidationError> {
    match service_type {
        "ClusterIP" | "NodePort" | "LoadBalancer" | "ExternalName" => Ok(()),
        _ => Err(ValidationError::new("invalid_service_type").with_message(
            "type must be ClusterIP, NodePort, LoadBalancer, or ExternalName".into(),
        )),
    }
}

/// Image and configuration location
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    #[serde(default)]
    #[validate(length(max = 255, message = "image reference exceeds 255 characters"))]
    pub name: Option<String>,

    #[serde(default)]
    #[validate(custom(function = "validate_presto_path"))]
    pub presto_path: Option<String>,
}

fn validate_presto_path(path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("relative_path")
            .with_message("prestoPath must be an absolute path".into()))
    }
}

/// An extra volume and where to mount it
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_volume_name"))]
pub struct PrestoVolume {
    /// A regular pod volume: its name plus any one volume source, inline
    #[serde(flatten)]
    #[schemars(schema_with = "pod_volume_schema")]
    pub volume: Volume,

    #[serde(default)]
    pub read_only: bool,

    #[validate(length(min = 1, message = "mountPath is required"))]
    pub mount_path: String,

    #[serde(default)]
    pub sub_path: Option<String>,

    #[serde(default)]
    pub mount_propagation: Option<String>,

    #[serde(default)]
    pub sub_path_expr: Option<String>,
}

fn validate_volume_name(volume: &PrestoVolume) -> Result<(), ValidationError> {
    if volume.volume.name.is_empty() {
        return Err(ValidationError::new("missing_name").with_message("volume name is required".into()));
    }
    validate_k8s_name(&volume.volume.name)
}

/// Volume sources are passed through untouched, so only the name is typed
fn pod_volume_schema(_: &mut SchemaGenerator) -> Schema {
    let mut object = ObjectValidation::default();
    object.required.insert("name".to_string());
    object.properties.insert(
        "name".to_string(),
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            ..Default::default()
        }
        .into(),
    );
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        object: Some(Box::new(object)),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema.into()
}

/// Status of a Presto resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrestoStatus {
    /// Cluster identifier, assigned once; every dependent name derives from it
    #[serde(default)]
    pub uuid: String,

    /// Worker replicas requested on the worker replica set
    #[serde(default)]
    pub desired_workers: i32,

    /// Worker replicas currently available
    #[serde(default)]
    pub current_workers: i32,

    #[serde(default)]
    pub headless_service: String,

    #[serde(default)]
    pub service: String,

    /// `clusterIP:port/nodePort` of the external service
    #[serde(default)]
    pub coordinator_address: String,

    #[serde(default)]
    pub catalog_config: String,

    #[serde(default)]
    pub coordinator_config: String,

    #[serde(default)]
    pub worker_config: String,

    #[serde(default)]
    pub worker_replicaset: String,

    #[serde(default)]
    pub coordinator_replicaset: String,

    /// Empty when autoscaling is off
    #[serde(default)]
    pub hpa_name: String,

    #[serde(default)]
    pub cluster_state: Option<ClusterState>,

    #[serde(default)]
    pub error_reason: String,

    /// Last time the status was written
    #[serde(default)]
    pub modification_time: Option<String>,

    #[serde(default, rename = "coordinatorCPU")]
    pub coordinator_cpu: String,

    #[serde(default, rename = "workerCPU")]
    pub worker_cpu: String,
}

/// Coarse state of a cluster, re-derived on every reconciliation
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// Resources are being created or the coordinator is starting
    Pending,
    /// The coordinator pod is running
    Ready,
    /// A convergence step failed or the coordinator pod failed
    Failed,
    /// The coordinator pod could not be observed
    Unknown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterState::Pending => "Pending",
            ClusterState::Ready => "Ready",
            ClusterState::Failed => "Failed",
            ClusterState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl PrestoSpec {
    /// Container image for both roles
    pub fn image(&self) -> &str {
        self.image_details
            .name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_IMAGE)
    }

    /// Directory the generated configuration is mounted at
    pub fn presto_path(&self) -> &str {
        self.image_details
            .presto_path
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PRESTO_PATH)
    }

    /// Directory catalog files are mounted at
    pub fn catalog_path(&self) -> String {
        format!("{}/catalog/", self.presto_path().trim_end_matches('/'))
    }

    /// Resource settings of one role
    pub fn node(&self, role: Role) -> &NodeSpec {
        match role {
            Role::Coordinator => &self.coordinator.node,
            Role::Worker => &self.worker.node,
        }
    }
}

impl WorkerSpec {
    pub fn termination_grace_period(&self) -> i64 {
        self.termination_grace_period_seconds
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS)
    }
}

impl Presto {
    /// The assigned cluster identifier, if any
    pub fn cluster_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.uuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    const SAMPLE: &str = r#"
apiVersion: falarica.io/v1alpha1
kind: Presto
metadata:
  name: analytics
  namespace: data
spec:
  coordinator:
    memoryLimit: 4Gi
    cpuLimit: "2"
    additionalJVMConfig: "-XX:+PrintGC"
    additionalProps:
      query.max-memory: 5GB
  worker:
    memoryLimit: 8Gi
    cpuLimit: 1500m
    count: 3
    autoscaling:
      enabled: true
      minReplicas: 2
      maxReplicas: 10
      targetCPUUtilizationPercentage: 70
  catalogs:
    catalogSpec:
      - name: hive
        content:
          connector.name: hive-hadoop2
    catalogSecrets:
      - secretName: pg-catalog
        secretKey: postgres
  service:
    type: NodePort
    port: 8443
    nodePort: 30080
  volumes:
    - name: scratch
      emptyDir: {}
      mountPath: /scratch
"#;

    fn sample() -> Presto {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_deserialize_sample() {
        let presto = sample();
        let spec = &presto.spec;

        assert_eq!(spec.coordinator.node.memory_limit, "4Gi");
        assert_eq!(
            spec.coordinator.node.additional_jvm_config.as_deref(),
            Some("-XX:+PrintGC")
        );
        assert_eq!(spec.worker.count, 3);
        assert_eq!(
            spec.worker.autoscaling.target_cpu_utilization_percentage,
            Some(70)
        );
        assert_eq!(spec.catalogs.catalog_spec[0].name, "hive");
        assert_eq!(spec.service.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.volumes[0].volume.name, "scratch");
        assert!(spec.volumes[0].volume.empty_dir.is_some());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let presto = sample();
        assert_eq!(presto.spec.image(), DEFAULT_IMAGE);
        assert_eq!(presto.spec.presto_path(), "/etc/presto");
        assert_eq!(presto.spec.catalog_path(), "/etc/presto/catalog/");
        assert_eq!(
            presto.spec.worker.termination_grace_period(),
            DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS
        );
        assert!(presto.cluster_uuid().is_none());
    }

    #[test]
    fn test_worker_count_range() {
        let mut presto = sample();
        presto.spec.worker.count = 0;
        assert!(presto.spec.validate().is_err());

        presto.spec.worker.count = 10001;
        assert!(presto.spec.validate().is_err());
    }

    #[test]
    fn test_autoscaling_validation() {
        let mut presto = sample();
        presto.spec.worker.autoscaling.target_cpu_utilization_percentage = Some(150);
        assert!(presto.spec.validate().is_err());

        let mut presto = sample();
        presto.spec.worker.autoscaling.min_replicas = Some(12);
        assert!(presto.spec.validate().is_err());
    }

    #[test]
    fn test_quantity_validation() {
        assert!(validate_quantity("4Gi").is_ok());
        assert!(validate_quantity("500m").is_ok());
        assert!(validate_quantity("1e3").is_ok());
        assert!(validate_quantity("four").is_err());

        let mut presto = sample();
        presto.spec.coordinator.node.cpu_limit = "two".to_string();
        assert!(presto.spec.validate().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let status = PrestoStatus {
            uuid: "abc".to_string(),
            cluster_state: Some(ClusterState::Ready),
            coordinator_cpu: "45%".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["clusterState"], "Ready");
        assert_eq!(json["coordinatorCPU"], "45%");
        assert_eq!(json["hpaName"], "");
    }

    #[test]
    fn test_crd_generation() {
        let crd = Presto::crd();
        assert_eq!(crd.spec.group, "falarica.io");
        assert_eq!(crd.spec.names.plural, "prestos");
        assert_eq!(crd.spec.names.kind, "Presto");
    }
}
