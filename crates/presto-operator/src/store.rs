//! Cluster API access used by the reconciler.
//!
//! `ClusterStore` is the seam between convergence logic and the API server:
//! the controller talks to `KubeStore`, tests talk to a mock or an in-memory
//! fake. Every list is a label-selector query inside one namespace.

use crate::crd::{Presto, PrestoStatus};
use crate::error::Result;
use crate::naming::label_selector;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Point-in-time resource usage of one pod, served by metrics-server
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

/// Usage of one container
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerMetrics {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

impl Resource for PodMetrics {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "PodMetrics".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "metrics.k8s.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1beta1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "pods".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Trait abstracting the Kubernetes operations needed to converge a cluster
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a Presto resource; `None` when it no longer exists
    async fn get_presto(&self, namespace: &str, name: &str) -> Result<Option<Presto>>;

    /// Replace the status of a Presto resource.
    ///
    /// With a resource version the write is rejected with a conflict if the
    /// object changed since it was read.
    async fn patch_presto_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &PrestoStatus,
    ) -> Result<()>;

    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    async fn list_config_maps(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<ConfigMap>;

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>>;

    async fn create_replica_set(&self, namespace: &str, replica_set: &ReplicaSet)
        -> Result<ReplicaSet>;

    /// Full replace; the object must carry the resource version it was read at
    async fn replace_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet>;

    async fn list_autoscalers(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>>;

    async fn create_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler>;

    async fn replace_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler>;

    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    /// Usage of the pods matching `selector`, from the metrics API
    async fn list_pod_metrics(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodMetrics>>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn list_params(selector: &BTreeMap<String, String>) -> ListParams {
        ListParams::default().labels(&label_selector(selector))
    }

    fn object_name<K: Resource>(object: &K) -> String {
        object.meta().name.clone().unwrap_or_default()
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_presto(&self, namespace: &str, name: &str) -> Result<Option<Presto>> {
        Ok(self.api::<Presto>(namespace).get_opt(name).await?)
    }

    async fn patch_presto_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &PrestoStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status
        });
        self.api::<Presto>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(name = %name, namespace = %namespace, "Patched Presto status");
        Ok(())
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        let list = self
            .api::<Service>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>> {
        let list = self
            .api::<ConfigMap>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        Ok(self
            .api::<ConfigMap>(namespace)
            .create(&PostParams::default(), config_map)
            .await?)
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>> {
        let list = self
            .api::<ReplicaSet>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet> {
        Ok(self
            .api::<ReplicaSet>(namespace)
            .create(&PostParams::default(), replica_set)
            .await?)
    }

    async fn replace_replica_set(
        &self,
        namespace: &str,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet> {
        Ok(self
            .api::<ReplicaSet>(namespace)
            .replace(
                &Self::object_name(replica_set),
                &PostParams::default(),
                replica_set,
            )
            .await?)
    }

    async fn list_autoscalers(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>> {
        let list = self
            .api::<HorizontalPodAutoscaler>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler> {
        Ok(self
            .api::<HorizontalPodAutoscaler>(namespace)
            .create(&PostParams::default(), autoscaler)
            .await?)
    }

    async fn replace_autoscaler(
        &self,
        namespace: &str,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler> {
        Ok(self
            .api::<HorizontalPodAutoscaler>(namespace)
            .replace(
                &Self::object_name(autoscaler),
                &PostParams::default(),
                autoscaler,
            )
            .await?)
    }

    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<HorizontalPodAutoscaler>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let list = self
            .api::<Pod>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_pod_metrics(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodMetrics>> {
        let list = self
            .api::<PodMetrics>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_metrics_resource() {
        assert_eq!(PodMetrics::api_version(&()), "metrics.k8s.io/v1beta1");
        assert_eq!(PodMetrics::plural(&()), "pods");
    }

    #[test]
    fn test_pod_metrics_deserialize() {
        let json = serde_json::json!({
            "metadata": { "name": "coordinator-abc", "namespace": "data" },
            "timestamp": "2024-05-01T10:00:00Z",
            "window": "30s",
            "containers": [
                { "name": "coordinatorcontainer-01234567", "usage": { "cpu": "250m", "memory": "1Gi" } }
            ]
        });
        let metrics: PodMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(metrics.containers.len(), 1);
        assert_eq!(
            metrics.containers[0].usage["cpu"],
            Quantity("250m".to_string())
        );
    }
}
