//! Presto Controller
//!
//! This module implements the Kubernetes controller pattern for managing
//! Presto custom resources. Each reconciliation makes at most one change to
//! the dependent resources, walking them in dependency order, and requeues
//! itself immediately until a pass finds nothing to do. That final pass
//! observes the coordinator pod and CPU usage and folds them into status.

use crate::crd::{ClusterState, Presto};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::resources::ResourceBuilder;
use crate::resync::{self, ResyncRegistry};
use crate::status::{self, StatusUpdate};
use crate::steps::{self, Step, StepContext, StepOutcome};
use crate::store::{ClusterStore, KubeStore};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::{predicates, reflector, watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller
pub struct ControllerContext {
    /// Reads and writes of cluster objects
    pub store: Arc<dyn ClusterStore>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Clusters re-enqueued by the resync loop
    pub registry: Arc<ResyncRegistry>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("presto_operator_reconciliations_total"),
            errors: metrics::counter!("presto_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("presto_operator_reconciliation_duration_seconds"),
        }
    }

    /// Count one create, update or delete of a dependent resource
    pub fn record_mutation(&self, step: Step, outcome: StepOutcome) {
        metrics::counter!(
            "presto_operator_resource_mutations_total",
            "kind" => step.kind().prefix().trim_end_matches('-'),
            "verb" => outcome.verb()
        )
        .increment(1);
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource no longer exists
    Gone,
    /// A step changed a dependent resource; run again straight away
    Changed(Step, StepOutcome),
    /// Everything exists; the observed state was written to status
    Converged(ClusterState),
    /// The spec cannot be converged; the reason was written to status
    Failed,
}

impl ReconcileOutcome {
    pub fn action(self) -> Action {
        match self {
            ReconcileOutcome::Changed(..) => Action::requeue(Duration::ZERO),
            _ => Action::await_change(),
        }
    }
}

/// Start the Presto controller.
///
/// Only generation changes of Presto resources trigger reconciliation;
/// changes to owned objects and the resync loop cover everything else.
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    resync_interval: Duration,
) -> Result<()> {
    let prestos: Api<Presto> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let registry = Arc::new(ResyncRegistry::new());
    let ctx = Arc::new(ControllerContext {
        store: Arc::new(KubeStore::new(client.clone())),
        events: Arc::new(KubeEventPublisher::new(client.clone())),
        registry: registry.clone(),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        resync_secs = resync_interval.as_secs(),
        "Starting Presto controller"
    );

    let (cache, writer) = reflector::store();
    let changes = watcher(prestos, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    let (trigger, resyncs) = futures::channel::mpsc::unbounded();
    tokio::spawn(resync::run_resync(
        registry,
        cache.clone(),
        trigger,
        resync_interval,
    ));

    // Watch owned resources for changes
    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    let config_maps = match &namespace {
        Some(ns) => Api::<ConfigMap>::namespaced(client.clone(), ns),
        None => Api::<ConfigMap>::all(client.clone()),
    };

    let replica_sets = match &namespace {
        Some(ns) => Api::<ReplicaSet>::namespaced(client.clone(), ns),
        None => Api::<ReplicaSet>::all(client.clone()),
    };

    Controller::for_stream(changes, cache)
        .owns(services, watcher::Config::default())
        .owns(config_maps, watcher::Config::default())
        .owns(replica_sets, watcher::Config::default())
        .reconcile_on(resyncs)
        // one reconciliation at a time keeps a single writer per cluster
        .with_config(controller::Config::default().concurrency(1))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(presto, ctx), fields(name = %presto.name_any(), namespace = presto.namespace()))]
async fn reconcile(presto: Arc<Presto>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = presto.namespace().unwrap_or_else(|| "default".to_string());
    let name = presto.name_any();

    let result = reconcile_presto(&namespace, &name, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            ctx.error_counts.remove(&format!("{}/{}", namespace, name));
            debug!(?outcome, "Reconcile pass finished");
            Ok(outcome.action())
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// One reconciliation pass for the Presto resource `namespace/name`.
///
/// The resource is always re-read from the API: the triggering object may
/// be a stale resync reference or a cached copy.
pub async fn reconcile_presto(
    namespace: &str,
    name: &str,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome> {
    let store = ctx.store.as_ref();

    let Some(presto) = store.get_presto(namespace, name).await? else {
        debug!("Presto not found, dropping from resync");
        ctx.registry.unregister(namespace, name);
        return Ok(ReconcileOutcome::Gone);
    };
    ctx.registry.register(&presto);

    let Some(presto) = ensure_identity(store, presto).await? else {
        ctx.registry.unregister(namespace, name);
        return Ok(ReconcileOutcome::Gone);
    };

    if let Err(e) = presto.spec.validate() {
        let err = OperatorError::ValidationError(e.to_string());
        return fail(ctx, &presto, StatusUpdate::new(), err).await;
    }

    let uuid = presto.cluster_uuid().unwrap_or_default().to_string();
    let builder = match ResourceBuilder::new(&presto, &uuid) {
        Ok(builder) => builder,
        Err(e) => return fail(ctx, &presto, StatusUpdate::new(), e).await,
    };
    let step_ctx = StepContext {
        store,
        builder: &builder,
        presto: &presto,
    };

    let mut update = StatusUpdate::new();
    for step in Step::ORDER {
        let outcome = match steps::run(step, &step_ctx, &mut update).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = e.in_step(step.describe());
                if err.is_configuration_error() {
                    return fail(ctx, &presto, update, err).await;
                }
                return Err(err);
            }
        };

        if outcome.changed() {
            info!(step = %step, verb = outcome.verb(), "Converged one resource");
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_mutation(step, outcome);
            }
            publish_change(ctx, &presto, &builder, step, outcome).await;
            update.apply(store, namespace, name).await?;
            return Ok(ReconcileOutcome::Changed(step, outcome));
        }
    }

    let state = status::observe(store, &presto, builder.names(), &mut update).await?;
    update.apply(store, namespace, name).await?;
    debug!(state = %state, "All resources present");
    Ok(ReconcileOutcome::Converged(state))
}

/// Assign a cluster identifier on first sight.
///
/// The identifier is written on its own, then the resource is re-read so
/// the rest of the pass works with the identifier that actually stuck.
/// Returns `None` if the resource disappeared in between.
async fn ensure_identity(store: &dyn ClusterStore, presto: Presto) -> Result<Option<Presto>> {
    if presto.cluster_uuid().is_some() {
        return Ok(Some(presto));
    }

    let namespace = presto.namespace().unwrap_or_default();
    let name = presto.name_any();
    let uuid = Uuid::new_v4().to_string();

    let mut update = StatusUpdate::new();
    update.uuid(uuid.as_str()).state(ClusterState::Pending);
    update.apply(store, &namespace, &name).await?;

    let Some(presto) = store.get_presto(&namespace, &name).await? else {
        return Ok(None);
    };
    match presto.cluster_uuid() {
        Some(assigned) => {
            info!(uuid = %assigned, "Assigned cluster identity");
            Ok(Some(presto))
        }
        None => Err(OperatorError::Conflict(format!(
            "cluster identity for {}/{} was not persisted",
            namespace, name
        ))),
    }
}

/// Record a configuration error on status and as a Warning event. The
/// cluster is left alone until its spec changes or it is resynced.
async fn fail(
    ctx: &ControllerContext,
    presto: &Presto,
    mut update: StatusUpdate,
    err: OperatorError,
) -> Result<ReconcileOutcome> {
    let reason = err.to_string();
    warn!(error = %reason, "Presto cluster cannot be converged");

    update.failed(reason.as_str());
    update
        .apply(
            ctx.store.as_ref(),
            &presto.namespace().unwrap_or_default(),
            &presto.name_any(),
        )
        .await?;

    ctx.events
        .publish(
            &presto.object_ref(&()),
            EventType::Warning,
            reasons::FAILED,
            actions::RECONCILE,
            Some(reason),
        )
        .await;
    Ok(ReconcileOutcome::Failed)
}

async fn publish_change(
    ctx: &ControllerContext,
    presto: &Presto,
    builder: &ResourceBuilder<'_>,
    step: Step,
    outcome: StepOutcome,
) {
    let (reason, action, verb) = match outcome {
        StepOutcome::Created => (reasons::CREATED, actions::CREATE, "Created"),
        StepOutcome::Updated => (reasons::UPDATED, actions::UPDATE, "Updated"),
        StepOutcome::Deleted => (reasons::DELETED, actions::DELETE, "Deleted"),
        StepOutcome::Unchanged => return,
    };
    let note = format!(
        "{} {} {}",
        verb,
        step.describe(),
        builder.names().name(step.kind())
    );
    ctx.events
        .publish(
            &presto.object_ref(&()),
            EventType::Normal,
            reason,
            action,
            Some(note),
        )
        .await;
}

/// Error policy for the controller
///
/// Implements exponential backoff for retries:
/// - 1st retry: 30s
/// - 2nd retry: 60s
/// - 3rd retry: 120s
/// - 4th retry: 240s
/// - 5th+ retry: 600s (capped)
fn error_policy(presto: Arc<Presto>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = format!(
        "{}/{}",
        presto.namespace().unwrap_or_default(),
        presto.name_any()
    );
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // Use the error's suggested delay OR exponential backoff:
    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
