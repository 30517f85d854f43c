//! Convergence steps.
//!
//! One step per dependent resource kind, run in [`Step::ORDER`]. A step
//! builds the desired object first (so configuration errors surface before
//! any API call), looks the live object up by its identity label, creates
//! it when absent and otherwise updates only the fields it owns.

use crate::autoscaling;
use crate::crd::{ClusterState, Presto};
use crate::error::Result;
use crate::naming::ResourceKind;
use crate::resources::ResourceBuilder;
use crate::status::StatusUpdate;
use crate::store::ClusterStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// What a step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Unchanged,
    Created,
    Updated,
    Deleted,
}

impl StepOutcome {
    pub fn changed(self) -> bool {
        self != StepOutcome::Unchanged
    }

    /// Verb used in metrics and logs
    pub fn verb(self) -> &'static str {
        match self {
            StepOutcome::Unchanged => "unchanged",
            StepOutcome::Created => "create",
            StepOutcome::Updated => "update",
            StepOutcome::Deleted => "delete",
        }
    }
}

/// The convergence steps, one per dependent resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    DiscoveryService,
    ExternalService,
    CoordinatorConfig,
    WorkerConfig,
    CatalogConfig,
    CoordinatorReplicaSet,
    WorkerReplicaSet,
    Autoscaler,
}

impl Step {
    /// Dependency order: services before the config that names them,
    /// config before the pods that mount it, workers before their autoscaler
    pub const ORDER: [Step; 8] = [
        Step::DiscoveryService,
        Step::ExternalService,
        Step::CoordinatorConfig,
        Step::WorkerConfig,
        Step::CatalogConfig,
        Step::CoordinatorReplicaSet,
        Step::WorkerReplicaSet,
        Step::Autoscaler,
    ];

    pub fn kind(self) -> ResourceKind {
        match self {
            Step::DiscoveryService => ResourceKind::DiscoveryService,
            Step::ExternalService => ResourceKind::ExternalService,
            Step::CoordinatorConfig => ResourceKind::CoordinatorConfig,
            Step::WorkerConfig => ResourceKind::WorkerConfig,
            Step::CatalogConfig => ResourceKind::CatalogConfig,
            Step::CoordinatorReplicaSet => ResourceKind::CoordinatorReplicaSet,
            Step::WorkerReplicaSet => ResourceKind::WorkerReplicaSet,
            Step::Autoscaler => ResourceKind::Autoscaler,
        }
    }

    /// Human-readable resource description for events and error reasons
    pub fn describe(self) -> &'static str {
        match self {
            Step::DiscoveryService => "headless service",
            Step::ExternalService => "service",
            Step::CoordinatorConfig => "coordinator config map",
            Step::WorkerConfig => "worker config map",
            Step::CatalogConfig => "catalog config map",
            Step::CoordinatorReplicaSet => "coordinator replicaset",
            Step::WorkerReplicaSet => "worker replicaset",
            Step::Autoscaler => "autoscaler",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Everything a step needs to talk about one cluster
pub struct StepContext<'a> {
    pub store: &'a dyn ClusterStore,
    pub builder: &'a ResourceBuilder<'a>,
    pub presto: &'a Presto,
}

impl StepContext<'_> {
    fn namespace(&self) -> &str {
        self.builder.namespace()
    }

    fn selector(&self, kind: ResourceKind) -> BTreeMap<String, String> {
        self.builder.names().identity_selector(kind)
    }
}

/// Run one step, folding its status contribution into `update`
pub async fn run(step: Step, ctx: &StepContext<'_>, update: &mut StatusUpdate) -> Result<StepOutcome> {
    let names = ctx.builder.names();
    let outcome = match step {
        Step::DiscoveryService => {
            let desired = ctx.builder.build_discovery_service();
            let (_, outcome) = ensure_created(ctx, step, desired).await?;
            update.headless_service(names.name(step.kind()));
            outcome
        }
        Step::ExternalService => {
            let desired = ctx.builder.build_external_service()?;
            let (live, outcome) = ensure_created(ctx, step, desired).await?;
            update.service(&live);
            outcome
        }
        Step::CoordinatorConfig => {
            let desired = ctx.builder.build_coordinator_config()?;
            let (_, outcome) = ensure_created(ctx, step, desired).await?;
            update.coordinator_config(names.name(step.kind()));
            outcome
        }
        Step::WorkerConfig => {
            let desired = ctx.builder.build_worker_config()?;
            let (_, outcome) = ensure_created(ctx, step, desired).await?;
            update.worker_config(names.name(step.kind()));
            outcome
        }
        Step::CatalogConfig => {
            let desired = ctx.builder.build_catalog_config();
            let (_, outcome) = ensure_created(ctx, step, desired).await?;
            update.catalog_config(names.name(step.kind()));
            outcome
        }
        Step::CoordinatorReplicaSet => {
            let desired = ctx.builder.build_coordinator_replica_set()?;
            let (_, outcome) = ensure_created(ctx, step, desired).await?;
            update.coordinator_replicaset(names.name(step.kind()));
            outcome
        }
        Step::WorkerReplicaSet => worker_replica_set(ctx, update).await?,
        Step::Autoscaler => autoscaling::reconcile_autoscaler(ctx, update).await?,
    };

    if outcome.changed() {
        update.state(ClusterState::Pending);
    }
    Ok(outcome)
}

/// Objects that are created once and never touched again
#[async_trait]
trait CreateOnce: Resource + Clone + Send + Sync + Sized {
    async fn list(
        store: &dyn ClusterStore,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Self>>;

    async fn create(store: &dyn ClusterStore, namespace: &str, object: &Self) -> Result<Self>;
}

#[async_trait]
impl CreateOnce for Service {
    async fn list(
        store: &dyn ClusterStore,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Self>> {
        store.list_services(namespace, selector).await
    }

    async fn create(store: &dyn ClusterStore, namespace: &str, object: &Self) -> Result<Self> {
        store.create_service(namespace, object).await
    }
}

#[async_trait]
impl CreateOnce for ConfigMap {
    async fn list(
        store: &dyn ClusterStore,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Self>> {
        store.list_config_maps(namespace, selector).await
    }

    async fn create(store: &dyn ClusterStore, namespace: &str, object: &Self) -> Result<Self> {
        store.create_config_map(namespace, object).await
    }
}

#[async_trait]
impl CreateOnce for ReplicaSet {
    async fn list(
        store: &dyn ClusterStore,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Self>> {
        store.list_replica_sets(namespace, selector).await
    }

    async fn create(store: &dyn ClusterStore, namespace: &str, object: &Self) -> Result<Self> {
        store.create_replica_set(namespace, object).await
    }
}

/// Return the live object for `step`, creating `desired` if there is none
async fn ensure_created<K: CreateOnce>(
    ctx: &StepContext<'_>,
    step: Step,
    desired: K,
) -> Result<(K, StepOutcome)> {
    let selector = ctx.selector(step.kind());
    if let Some(live) = K::list(ctx.store, ctx.namespace(), &selector)
        .await?
        .into_iter()
        .next()
    {
        debug!(step = %step, name = %live.name_any(), "Resource exists");
        return Ok((live, StepOutcome::Unchanged));
    }

    let created = K::create(ctx.store, ctx.namespace(), &desired).await?;
    info!(
        step = %step,
        name = %created.name_any(),
        namespace = %ctx.namespace(),
        "Created resource"
    );
    Ok((created, StepOutcome::Created))
}

/// Create the worker replica set, then keep its replica count on the spec
/// count while nothing else (the autoscaler) owns it
async fn worker_replica_set(ctx: &StepContext<'_>, update: &mut StatusUpdate) -> Result<StepOutcome> {
    let desired = ctx.builder.build_worker_replica_set()?;
    let (live, outcome) = ensure_created(ctx, Step::WorkerReplicaSet, desired).await?;
    if outcome.changed() {
        update.worker_replicaset(&live);
        return Ok(outcome);
    }

    let worker = &ctx.presto.spec.worker;
    let live_replicas = live.spec.as_ref().and_then(|s| s.replicas);
    if worker.autoscaling.enabled || live_replicas == Some(worker.count) {
        update.worker_replicaset(&live);
        return Ok(StepOutcome::Unchanged);
    }

    info!(
        name = %live.name_any(),
        from = ?live_replicas,
        to = worker.count,
        "Scaling worker replicaset"
    );
    let mut scaled = live;
    if let Some(spec) = scaled.spec.as_mut() {
        spec.replicas = Some(worker.count);
    }
    let replaced = ctx.store.replace_replica_set(ctx.namespace(), &scaled).await?;
    update.worker_replicaset(&replaced);
    Ok(StepOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PrestoStatus;
    use crate::store::MockClusterStore;
    use crate::testing::{create_test_presto, FakeStore, UUID};

    async fn run_all(store: &dyn ClusterStore, presto: &Presto) -> Vec<StepOutcome> {
        let builder = ResourceBuilder::new(presto, UUID).unwrap();
        let ctx = StepContext {
            store,
            builder: &builder,
            presto,
        };
        let mut outcomes = Vec::new();
        for step in Step::ORDER {
            let mut update = StatusUpdate::new();
            outcomes.push(run(step, &ctx, &mut update).await.unwrap());
        }
        outcomes
    }

    #[test]
    fn test_order_covers_every_owned_kind() {
        let kinds: Vec<_> = Step::ORDER.iter().map(|s| s.kind()).collect();
        for kind in ResourceKind::ALL {
            assert_eq!(
                kinds.contains(&kind),
                kind.identity_label().is_some(),
                "{:?}",
                kind
            );
        }
    }

    #[tokio::test]
    async fn test_steps_create_then_settle() {
        let presto = create_test_presto("analytics");
        let store = FakeStore::default();

        let first = run_all(&store, &presto).await;
        assert_eq!(first[..7], [StepOutcome::Created; 7]);
        // autoscaling is off
        assert_eq!(first[7], StepOutcome::Unchanged);
        assert_eq!(store.state().creates, 7);

        let second = run_all(&store, &presto).await;
        assert!(second.iter().all(|o| *o == StepOutcome::Unchanged));
        assert_eq!(store.state().mutations(), 7);
    }

    #[tokio::test]
    async fn test_external_service_reports_address() {
        let mut presto = create_test_presto("analytics");
        presto.spec.service.type_ = Some("NodePort".to_string());
        presto.spec.service.node_port = Some(30080);
        let store = FakeStore::default();
        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let ctx = StepContext {
            store: &store,
            builder: &builder,
            presto: &presto,
        };

        let mut update = StatusUpdate::new();
        let outcome = run(Step::ExternalService, &ctx, &mut update).await.unwrap();
        assert_eq!(outcome, StepOutcome::Created);

        let mut status = PrestoStatus::default();
        update.fold_into(&mut status);
        assert_eq!(status.service, "external-presto-svc-01234567");
        assert!(status.coordinator_address.ends_with(":8080/30080"));
        assert_eq!(status.cluster_state, Some(ClusterState::Pending));
    }

    #[tokio::test]
    async fn test_external_name_fails_before_store_calls() {
        let mut presto = create_test_presto("analytics");
        presto.spec.service.type_ = Some("ExternalName".to_string());
        let mut store = MockClusterStore::new();
        store.expect_list_services().times(0);
        store.expect_create_service().times(0);

        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let ctx = StepContext {
            store: &store,
            builder: &builder,
            presto: &presto,
        };
        let err = run(Step::ExternalService, &ctx, &mut StatusUpdate::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_existing_config_map_is_not_rewritten() {
        let presto = create_test_presto("analytics");
        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let mut existing = builder.build_worker_config().unwrap();
        existing.data = Some(BTreeMap::from([(
            "config.properties".to_string(),
            "edited by hand".to_string(),
        )]));

        let mut store = MockClusterStore::new();
        store
            .expect_list_config_maps()
            .returning(move |_, _| Ok(vec![existing.clone()]));
        store.expect_create_config_map().times(0);

        let ctx = StepContext {
            store: &store,
            builder: &builder,
            presto: &presto,
        };
        let outcome = run(Step::WorkerConfig, &ctx, &mut StatusUpdate::new())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_worker_count_change_updates_replicaset() {
        let mut presto = create_test_presto("analytics");
        let store = FakeStore::default();
        run_all(&store, &presto).await;

        presto.spec.worker.count = 5;
        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let ctx = StepContext {
            store: &store,
            builder: &builder,
            presto: &presto,
        };
        let mut update = StatusUpdate::new();
        let outcome = run(Step::WorkerReplicaSet, &ctx, &mut update).await.unwrap();
        assert_eq!(outcome, StepOutcome::Updated);

        let mut status = PrestoStatus::default();
        update.fold_into(&mut status);
        assert_eq!(status.desired_workers, 5);
        assert_eq!(store.state().updates, 1);

        let outcome = run(Step::WorkerReplicaSet, &ctx, &mut StatusUpdate::new())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_worker_count_ignored_while_autoscaling() {
        let mut presto = create_test_presto("analytics");
        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let mut live = builder.build_worker_replica_set().unwrap();
        live.spec.as_mut().unwrap().replicas = Some(7);

        presto.spec.worker.autoscaling.enabled = true;
        let builder = ResourceBuilder::new(&presto, UUID).unwrap();
        let mut store = MockClusterStore::new();
        store
            .expect_list_replica_sets()
            .returning(move |_, _| Ok(vec![live.clone()]));
        store.expect_replace_replica_set().times(0);
        store.expect_create_replica_set().times(0);

        let ctx = StepContext {
            store: &store,
            builder: &builder,
            presto: &presto,
        };
        let mut update = StatusUpdate::new();
        let outcome = run(Step::WorkerReplicaSet, &ctx, &mut update).await.unwrap();
        assert_eq!(outcome, StepOutcome::Unchanged);

        let mut status = PrestoStatus::default();
        update.fold_into(&mut status);
        assert_eq!(status.desired_workers, 7);
    }
}
