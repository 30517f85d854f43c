//! Deterministic names and labels for the resources owned by a Presto cluster.
//!
//! Every dependent object is named `<prefix><first 8 chars of the cluster uuid>`
//! and carries the cluster's base labels plus one identity label keyed by its
//! kind. Lookups always go through the identity label, never through names.

use std::collections::BTreeMap;

/// Label carrying the cluster uuid on every dependent resource
pub const CLUSTER_UUID_LABEL: &str = "clusterUUID";

/// Label carrying the Presto resource name on every dependent resource
pub const CLUSTER_NAME_LABEL: &str = "clusterName";

const SHORT_ID_LEN: usize = 8;

/// Every kind of object derived from a Presto cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DiscoveryService,
    ExternalService,
    CoordinatorConfig,
    WorkerConfig,
    CatalogConfig,
    CoordinatorReplicaSet,
    WorkerReplicaSet,
    Autoscaler,
    CoordinatorContainer,
    WorkerContainer,
    CoordinatorConfigVolume,
    WorkerConfigVolume,
    CatalogVolume,
    HttpsSecretVolume,
}

impl ResourceKind {
    /// All kinds, in no particular order
    pub const ALL: [ResourceKind; 14] = [
        ResourceKind::DiscoveryService,
        ResourceKind::ExternalService,
        ResourceKind::CoordinatorConfig,
        ResourceKind::WorkerConfig,
        ResourceKind::CatalogConfig,
        ResourceKind::CoordinatorReplicaSet,
        ResourceKind::WorkerReplicaSet,
        ResourceKind::Autoscaler,
        ResourceKind::CoordinatorContainer,
        ResourceKind::WorkerContainer,
        ResourceKind::CoordinatorConfigVolume,
        ResourceKind::WorkerConfigVolume,
        ResourceKind::CatalogVolume,
        ResourceKind::HttpsSecretVolume,
    ];

    /// Name prefix; the short cluster id is appended directly
    pub fn prefix(self) -> &'static str {
        match self {
            ResourceKind::DiscoveryService => "pod-discovery-",
            ResourceKind::ExternalService => "external-presto-svc-",
            ResourceKind::CoordinatorConfig => "coordinatorconfig-",
            ResourceKind::WorkerConfig => "workerconfig-",
            ResourceKind::CatalogConfig => "catalogconfig-",
            ResourceKind::CoordinatorReplicaSet => "coordinatorreplicaset-",
            ResourceKind::WorkerReplicaSet => "workerreplicaset-",
            ResourceKind::Autoscaler => "hpa-",
            ResourceKind::CoordinatorContainer => "coordinatorcontainer-",
            ResourceKind::WorkerContainer => "workercontainer-",
            ResourceKind::CoordinatorConfigVolume => "coordinatorconfvol-",
            ResourceKind::WorkerConfigVolume => "workerconfvol-",
            ResourceKind::CatalogVolume => "catalogvol-",
            ResourceKind::HttpsSecretVolume => "httpssecret-",
        }
    }

    /// Key of the identity label used to look this kind up.
    ///
    /// Containers and volumes are not API objects and have no identity label.
    pub fn identity_label(self) -> Option<&'static str> {
        match self {
            ResourceKind::DiscoveryService => Some("pod-discovery"),
            ResourceKind::ExternalService => Some("external-presto-svc"),
            ResourceKind::CoordinatorConfig => Some("coordinator-config"),
            ResourceKind::WorkerConfig => Some("worker-config"),
            ResourceKind::CatalogConfig => Some("catalog-config"),
            ResourceKind::CoordinatorReplicaSet => Some("coordinator"),
            ResourceKind::WorkerReplicaSet => Some("worker"),
            ResourceKind::Autoscaler => Some("hpa"),
            _ => None,
        }
    }
}

/// The two kinds of Presto node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn container(self) -> ResourceKind {
        match self {
            Role::Coordinator => ResourceKind::CoordinatorContainer,
            Role::Worker => ResourceKind::WorkerContainer,
        }
    }

    pub fn replica_set(self) -> ResourceKind {
        match self {
            Role::Coordinator => ResourceKind::CoordinatorReplicaSet,
            Role::Worker => ResourceKind::WorkerReplicaSet,
        }
    }

    pub fn config(self) -> ResourceKind {
        match self {
            Role::Coordinator => ResourceKind::CoordinatorConfig,
            Role::Worker => ResourceKind::WorkerConfig,
        }
    }

    pub fn config_volume(self) -> ResourceKind {
        match self {
            Role::Coordinator => ResourceKind::CoordinatorConfigVolume,
            Role::Worker => ResourceKind::WorkerConfigVolume,
        }
    }
}

/// Name and label derivation for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    cluster_name: String,
    uuid: String,
}

impl ClusterNames {
    pub fn new(cluster_name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            uuid: uuid.into(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// First 8 characters of the uuid, or the whole id when shorter
    pub fn short_id(&self) -> &str {
        match self.uuid.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.uuid[..idx],
            None => &self.uuid,
        }
    }

    pub fn name(&self, kind: ResourceKind) -> String {
        format!("{}{}", kind.prefix(), self.short_id())
    }

    /// Labels shared by every object of the cluster
    pub fn base_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_UUID_LABEL.to_string(), self.uuid.clone());
        labels.insert(CLUSTER_NAME_LABEL.to_string(), self.cluster_name.clone());
        labels
    }

    /// The single-entry selector that identifies objects of `kind`
    pub fn identity_selector(&self, kind: ResourceKind) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(key) = kind.identity_label() {
            labels.insert(key.to_string(), self.uuid.clone());
        }
        labels
    }

    /// Base labels plus the identity label for `kind`
    pub fn labels(&self, kind: ResourceKind) -> BTreeMap<String, String> {
        let mut labels = self.base_labels();
        labels.extend(self.identity_selector(kind));
        labels
    }

    /// Selector matching every pod of `role`
    pub fn pod_selector(&self, role: Role) -> BTreeMap<String, String> {
        self.identity_selector(role.replica_set())
    }

    /// In-cluster DNS name of the coordinator, resolvable through the
    /// discovery service
    pub fn coordinator_internal_address(&self) -> String {
        format!(
            "{}.{}",
            self.name(ResourceKind::CoordinatorContainer),
            self.name(ResourceKind::DiscoveryService)
        )
    }
}

/// Render a label map as an equality-based selector string (`k=v,k=v`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
