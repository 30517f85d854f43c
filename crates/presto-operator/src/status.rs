//! Status folding and live-signal observation.
//!
//! Every contribution made during one reconciliation lands in a single
//! [`StatusUpdate`]. Applying it re-reads the Presto resource, overlays the
//! fields that were set and writes once, and only if something differs.

use crate::crd::{ClusterState, Presto, PrestoSpec, PrestoStatus};
use crate::error::Result;
use crate::naming::{ClusterNames, Role};
use crate::quantity::parse_quantity;
use crate::store::{ClusterStore, PodMetrics};
use chrono::Utc;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, warn};

/// The status fields one reconciliation wants to set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    uuid: Option<String>,
    headless_service: Option<String>,
    service: Option<String>,
    coordinator_address: Option<String>,
    coordinator_config: Option<String>,
    worker_config: Option<String>,
    catalog_config: Option<String>,
    coordinator_replicaset: Option<String>,
    worker_replicaset: Option<String>,
    desired_workers: Option<i32>,
    current_workers: Option<i32>,
    hpa_name: Option<String>,
    cluster_state: Option<ClusterState>,
    error_reason: Option<String>,
    coordinator_cpu: Option<String>,
    worker_cpu: Option<String>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn uuid(&mut self, uuid: impl Into<String>) -> &mut Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn headless_service(&mut self, name: impl Into<String>) -> &mut Self {
        self.headless_service = Some(name.into());
        self
    }

    /// Record the external service and the address clients reach it at
    pub fn service(&mut self, service: &Service) -> &mut Self {
        self.service = Some(service.name_any());
        self.coordinator_address = Some(coordinator_address(service));
        self
    }

    pub fn coordinator_config(&mut self, name: impl Into<String>) -> &mut Self {
        self.coordinator_config = Some(name.into());
        self
    }

    pub fn worker_config(&mut self, name: impl Into<String>) -> &mut Self {
        self.worker_config = Some(name.into());
        self
    }

    pub fn catalog_config(&mut self, name: impl Into<String>) -> &mut Self {
        self.catalog_config = Some(name.into());
        self
    }

    pub fn coordinator_replicaset(&mut self, name: impl Into<String>) -> &mut Self {
        self.coordinator_replicaset = Some(name.into());
        self
    }

    /// Record the worker replica set with its requested and available counts
    pub fn worker_replicaset(&mut self, replica_set: &ReplicaSet) -> &mut Self {
        self.worker_replicaset = Some(replica_set.name_any());
        self.desired_workers = Some(
            replica_set
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
        );
        self.current_workers = Some(
            replica_set
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
        );
        self
    }

    /// Empty when autoscaling is off
    pub fn hpa_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.hpa_name = Some(name.into());
        self
    }

    pub fn state(&mut self, state: ClusterState) -> &mut Self {
        self.cluster_state = Some(state);
        self
    }

    /// Mark the cluster failed with a reason
    pub fn failed(&mut self, reason: impl Into<String>) -> &mut Self {
        self.error_reason = Some(reason.into());
        self.cluster_state = Some(ClusterState::Failed);
        self
    }

    pub fn cpu(&mut self, coordinator_percent: i64, worker_percent: i64) -> &mut Self {
        self.coordinator_cpu = Some(format!("{}%", coordinator_percent));
        self.worker_cpu = Some(format!("{}%", worker_percent));
        self
    }

    /// Overlay the set fields onto `status`
    pub fn fold_into(&self, status: &mut PrestoStatus) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        // identity is assigned once
        if status.uuid.is_empty() {
            set(&mut status.uuid, &self.uuid);
        }
        set(&mut status.headless_service, &self.headless_service);
        set(&mut status.service, &self.service);
        set(&mut status.coordinator_address, &self.coordinator_address);
        set(&mut status.coordinator_config, &self.coordinator_config);
        set(&mut status.worker_config, &self.worker_config);
        set(&mut status.catalog_config, &self.catalog_config);
        set(&mut status.coordinator_replicaset, &self.coordinator_replicaset);
        set(&mut status.worker_replicaset, &self.worker_replicaset);
        set(&mut status.desired_workers, &self.desired_workers);
        set(&mut status.current_workers, &self.current_workers);
        set(&mut status.hpa_name, &self.hpa_name);
        set(&mut status.error_reason, &self.error_reason);
        set(&mut status.coordinator_cpu, &self.coordinator_cpu);
        set(&mut status.worker_cpu, &self.worker_cpu);
        if self.cluster_state.is_some() {
            status.cluster_state = self.cluster_state;
        }
    }

    /// Write the update onto the latest stored version of the resource.
    ///
    /// Returns whether a write happened. A resource that has disappeared in
    /// the meantime is not an error.
    pub async fn apply(&self, store: &dyn ClusterStore, namespace: &str, name: &str) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }

        let Some(latest) = store.get_presto(namespace, name).await? else {
            debug!(name = %name, namespace = %namespace, "Presto gone before status write");
            return Ok(false);
        };

        let current = latest.status.clone().unwrap_or_default();
        let mut next = current.clone();
        self.fold_into(&mut next);
        if next == current {
            return Ok(false);
        }

        next.modification_time = Some(Utc::now().to_rfc3339());
        store
            .patch_presto_status(namespace, name, latest.resource_version(), &next)
            .await?;
        Ok(true)
    }
}

/// `clusterIP:port/nodePort`, with 0 for an unassigned node port
pub fn coordinator_address(service: &Service) -> String {
    let spec = service.spec.as_ref();
    let cluster_ip = spec.and_then(|s| s.cluster_ip.as_deref()).unwrap_or("");
    let port = spec.and_then(|s| s.ports.as_ref()).and_then(|p| p.first());
    format!(
        "{}:{}/{}",
        cluster_ip,
        port.map(|p| p.port).unwrap_or(0),
        port.and_then(|p| p.node_port).unwrap_or(0)
    )
}

/// Map a pod phase onto the cluster state; `None` means the phase could
/// not be determined
pub fn state_for_phase(phase: Option<&str>) -> ClusterState {
    match phase {
        Some("Pending") => ClusterState::Pending,
        Some("Failed") => ClusterState::Failed,
        Some("Running") => ClusterState::Ready,
        _ => ClusterState::Unknown,
    }
}

/// Fold the coordinator pod phase, and CPU usage of a running cluster,
/// into `update`
pub async fn observe(
    store: &dyn ClusterStore,
    presto: &Presto,
    names: &ClusterNames,
    update: &mut StatusUpdate,
) -> Result<ClusterState> {
    let namespace = presto.namespace().unwrap_or_default();
    let pods = store
        .list_pods(&namespace, &names.pod_selector(Role::Coordinator))
        .await?;
    let phase = pods
        .first()
        .and_then(|p| p.status.as_ref())
        .and_then(|s| s.phase.as_deref());

    let state = state_for_phase(phase);
    update.state(state);

    if state == ClusterState::Ready {
        let coordinator =
            cpu_utilization(store, &namespace, names, &presto.spec, Role::Coordinator).await;
        let worker = cpu_utilization(store, &namespace, names, &presto.spec, Role::Worker).await;
        update.cpu(coordinator, worker);
    }

    Ok(state)
}

/// Percentage of the CPU limit used across all pods of `role`
pub async fn cpu_utilization(
    store: &dyn ClusterStore,
    namespace: &str,
    names: &ClusterNames,
    spec: &PrestoSpec,
    role: Role,
) -> i64 {
    let limit = match parse_quantity(&spec.node(role).cpu_limit) {
        Ok(limit) => limit,
        Err(e) => {
            warn!(role = ?role, error = %e, "Unparseable CPU limit");
            return 0;
        }
    };

    match store
        .list_pod_metrics(namespace, &names.pod_selector(role))
        .await
    {
        Ok(metrics) => utilization(&metrics, &names.name(role.container()), limit),
        Err(e) => {
            warn!(role = ?role, error = %e, "Failed to fetch CPU stats");
            0
        }
    }
}

/// `sum(used) * 100 / sum(limit)` over every container called `container`;
/// 0 when no container matches
pub fn utilization(metrics: &[PodMetrics], container: &str, limit_millis: i64) -> i64 {
    let mut allotted: i64 = 0;
    let mut used: i64 = 0;
    for usage in metrics
        .iter()
        .flat_map(|m| m.containers.iter())
        .filter(|c| c.name == container)
    {
        let Some(cpu) = usage.usage.get("cpu") else {
            continue;
        };
        // a malformed sample counts as idle
        used = used.saturating_add(parse_quantity(&cpu.0).unwrap_or(0));
        allotted = allotted.saturating_add(limit_millis);
    }

    if allotted == 0 {
        0
    } else {
        used.saturating_mul(100) / allotted
    }
}
