//! Fixtures shared by the unit tests: a sample Presto resource, an
//! in-memory `ClusterStore` that behaves like a small API server, and an
//! event publisher that remembers what it was told.

use crate::crd::{CoordinatorSpec, NodeSpec, Presto, PrestoSpec, PrestoStatus, WorkerSpec};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::store::{ClusterStore, ContainerMetrics, PodMetrics};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

pub const UUID: &str = "0123456789abcdef";

/// Coordinator 2 cores / 4Gi, three workers at 1 core / 8Gi, nothing optional
pub fn create_test_presto(name: &str) -> Presto {
    let mut presto = Presto::new(
        name,
        PrestoSpec {
            coordinator: CoordinatorSpec {
                node: NodeSpec {
                    memory_limit: "4Gi".to_string(),
                    cpu_limit: "2".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            worker: WorkerSpec {
                node: NodeSpec {
                    memory_limit: "8Gi".to_string(),
                    cpu_limit: "1".to_string(),
                    cpu_request: Some("500m".to_string()),
                    ..Default::default()
                },
                count: 3,
                ..Default::default()
            },
            catalogs: Default::default(),
            service: Default::default(),
            image_details: Default::default(),
            additional_presto_prop_files: BTreeMap::new(),
            volumes: vec![],
        },
    );
    presto.metadata.namespace = Some("default".to_string());
    presto.metadata.uid = Some("test-uid-123".to_string());
    presto
}

/// The sample resource with an identity already assigned
pub fn create_identified_presto(name: &str) -> Presto {
    let mut presto = create_test_presto(name);
    presto.status = Some(PrestoStatus {
        uuid: UUID.to_string(),
        ..Default::default()
    });
    presto
}

/// One pod sample with a single container using `cpu`
pub fn pod_metrics(container: &str, cpu: &str) -> PodMetrics {
    PodMetrics {
        containers: vec![ContainerMetrics {
            name: container.to_string(),
            usage: [("cpu".to_string(), Quantity(cpu.to_string()))]
                .into_iter()
                .collect(),
        }],
        ..Default::default()
    }
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}

/// Objects held by [`FakeStore`] plus counters of the mutations made
#[derive(Default)]
pub struct FakeState {
    pub prestos: Vec<Presto>,
    pub services: Vec<Service>,
    pub config_maps: Vec<ConfigMap>,
    pub replica_sets: Vec<ReplicaSet>,
    pub autoscalers: Vec<HorizontalPodAutoscaler>,
    pub pods: Vec<Pod>,
    pub pod_metrics: Vec<PodMetrics>,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub status_writes: usize,
    revision: u64,
}

impl FakeState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    /// Creates, updates and deletes of dependent resources
    pub fn mutations(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// In-memory object store with label selection, resource versions and
/// AlreadyExists/Conflict semantics
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    pub fn with_presto(presto: Presto) -> Self {
        let store = Self::default();
        {
            let mut state = store.state();
            let mut presto = presto;
            presto.metadata.resource_version = Some(state.next_revision());
            state.prestos.push(presto);
        }
        store
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn presto(&self, name: &str) -> Option<Presto> {
        self.state()
            .prestos
            .iter()
            .find(|p| p.name_any() == name)
            .cloned()
    }

    pub fn status(&self, name: &str) -> PrestoStatus {
        self.presto(name)
            .and_then(|p| p.status)
            .unwrap_or_default()
    }
}

fn selected<K: Resource>(
    object: &K,
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> bool {
    let meta = object.meta();
    let labels = meta.labels.clone().unwrap_or_default();
    meta.namespace.as_deref() == Some(namespace)
        && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn select<K: Resource + Clone>(
    objects: &[K],
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> Vec<K> {
    objects
        .iter()
        .filter(|o| selected(*o, namespace, selector))
        .cloned()
        .collect()
}

fn same_object(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    a.name == b.name && a.namespace == b.namespace
}

fn insert<K: Resource + Clone>(
    objects: &mut Vec<K>,
    revision: String,
    namespace: &str,
    object: &K,
) -> Result<K> {
    let mut object = object.clone();
    object.meta_mut().namespace = Some(namespace.to_string());
    if objects.iter().any(|o| same_object(o.meta(), object.meta())) {
        return Err(api_error(409, "AlreadyExists").into());
    }
    object.meta_mut().resource_version = Some(revision.clone());
    object.meta_mut().uid = Some(format!("uid-{}", revision));
    objects.push(object.clone());
    Ok(object)
}

fn replace<K: Resource + Clone>(
    objects: &mut [K],
    revision: String,
    namespace: &str,
    object: &K,
) -> Result<K> {
    let mut object = object.clone();
    object.meta_mut().namespace = Some(namespace.to_string());
    let Some(slot) = objects
        .iter_mut()
        .find(|o| same_object(o.meta(), object.meta()))
    else {
        return Err(api_error(404, "NotFound").into());
    };
    if object.meta().resource_version.is_some()
        && object.meta().resource_version != slot.meta().resource_version
    {
        return Err(api_error(409, "Conflict").into());
    }
    object.meta_mut().resource_version = Some(revision);
    *slot = object.clone();
    Ok(object)
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get_presto(&self, namespace: &str, name: &str) -> Result<Option<Presto>> {
        Ok(self
            .state()
            .prestos
            .iter()
            .find(|p| p.name_any() == name && p.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn patch_presto_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &PrestoStatus,
    ) -> Result<()> {
        let mut state = self.state();
        let revision = state.next_revision();
        let Some(presto) = state
            .prestos
            .iter_mut()
            .find(|p| p.name_any() == name && p.namespace().as_deref() == Some(namespace))
        else {
            return Err(api_error(404, "NotFound").into());
        };
        if resource_version.is_some() && resource_version != presto.metadata.resource_version {
            return Err(api_error(409, "Conflict").into());
        }
        presto.status = Some(status.clone());
        presto.metadata.resource_version = Some(revision);
        state.status_writes += 1;
        Ok(())
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        Ok(select(&self.state().services, namespace, selector))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut state = self.state();
        let revision = state.next_revision();
        let mut service = service.clone();
        if let Some(spec) = service.spec.as_mut() {
            if spec.cluster_ip.is_none() {
                spec.cluster_ip = Some(format!("10.96.0.{}", revision));
            }
        }
        let created = insert(&mut state.services, revision, namespace, &service)?;
        state.creates += 1;
        Ok(created)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>> {
        Ok(select(&self.state().config_maps, namespace, selector))
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let mut state = self.state();
        let revision = state.next_revision();
        let created = insert(&mut state.config_maps, revision, namespace, config_map)?;
        state.creates += 1;
        Ok(created)
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>> {
        Ok(select(&self.state().replica_sets, namespace, selector))
    }

    async fn create_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet> {
        let mut state = self.state();
        let revision = state.next_revision();
        let created = insert(&mut state.replica_sets, revision, namespace, replica_set)?;
        state.creates += 1;
        Ok(created)
    }

    async fn replace_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet> {
        let mut state = self.state();
        let revision = state.next_revision();
        let replaced = replace(&mut state.replica_sets, revision, namespace, replica_set)?;
        state.updates += 1;
        Ok(replaced)
    }

    async fn list_autoscalers(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>> {
        Ok(select(&self.state().autoscalers, namespace, selector))
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler> {
        let mut state = self.state();
        let revision = state.next_revision();
        let created = insert(&mut state.autoscalers, revision, namespace, autoscaler)?;
        state.creates += 1;
        Ok(created)
    }

    async fn replace_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler> {
        let mut state = self.state();
        let revision = state.next_revision();
        let replaced = replace(&mut state.autoscalers, revision, namespace, autoscaler)?;
        state.updates += 1;
        Ok(replaced)
    }

    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let before = state.autoscalers.len();
        state.autoscalers.retain(|h| {
            !(h.metadata.name.as_deref() == Some(name)
                && h.metadata.namespace.as_deref() == Some(namespace))
        });
        if state.autoscalers.len() == before {
            return Err(api_error(404, "NotFound").into());
        }
        state.deletes += 1;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(select(&self.state().pods, namespace, selector))
    }

    async fn list_pod_metrics(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodMetrics>> {
        Ok(select(&self.state().pod_metrics, namespace, selector))
    }
}

/// An event seen by [`RecordingEventPublisher`]
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}
