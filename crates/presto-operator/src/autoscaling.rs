//! Worker autoscaler reconciliation.
//!
//! | live autoscaler | autoscaling enabled | action                        |
//! |-----------------|---------------------|-------------------------------|
//! | absent          | yes                 | create                        |
//! | present         | yes                 | update if any bound differs   |
//! | present         | no                  | delete                        |
//! | absent          | no                  | nothing                       |

use crate::error::{is_already_exists, OperatorError, Result};
use crate::naming::ResourceKind;
use crate::resources::AutoscalerTargets;
use crate::status::StatusUpdate;
use crate::steps::{StepContext, StepOutcome};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use kube::ResourceExt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscalerAction {
    Create,
    Update,
    Delete,
    Keep,
    Nothing,
}

/// Decide what to do given the live autoscaler and the wanted bounds
/// (`None` when autoscaling is disabled)
pub fn decide(
    live: Option<&HorizontalPodAutoscaler>,
    wanted: Option<&AutoscalerTargets>,
) -> AutoscalerAction {
    match (live, wanted) {
        (None, Some(_)) => AutoscalerAction::Create,
        (Some(hpa), Some(targets)) if !targets.matches(hpa) => AutoscalerAction::Update,
        (Some(_), Some(_)) => AutoscalerAction::Keep,
        (Some(_), None) => AutoscalerAction::Delete,
        (None, None) => AutoscalerAction::Nothing,
    }
}

/// Converge the worker autoscaler. All bounds are checked before the first
/// API call, so an incomplete policy never creates, updates or deletes.
pub async fn reconcile_autoscaler(
    ctx: &StepContext<'_>,
    update: &mut StatusUpdate,
) -> Result<StepOutcome> {
    let spec = &ctx.presto.spec;
    let wanted = if spec.worker.autoscaling.enabled {
        Some(AutoscalerTargets::from_spec(spec)?)
    } else {
        None
    };

    let names = ctx.builder.names();
    let namespace = ctx.builder.namespace();
    let name = names.name(ResourceKind::Autoscaler);
    let live = ctx
        .store
        .list_autoscalers(namespace, &names.identity_selector(ResourceKind::Autoscaler))
        .await?
        .into_iter()
        .next();

    match (decide(live.as_ref(), wanted.as_ref()), live, wanted) {
        (AutoscalerAction::Create, _, _) => {
            let desired = ctx.builder.build_autoscaler()?;
            match ctx.store.create_autoscaler(namespace, &desired).await {
                Ok(_) => info!(name = %name, "Created autoscaler"),
                Err(OperatorError::KubeError(e)) if is_already_exists(&e) => {
                    debug!(name = %name, "Autoscaler created concurrently");
                }
                Err(e) => return Err(e),
            }
            update.hpa_name(name);
            Ok(StepOutcome::Created)
        }
        (AutoscalerAction::Update, Some(mut hpa), Some(targets)) => {
            // the live object carries its resourceVersion into the replace
            targets.apply_to(&mut hpa);
            ctx.store.replace_autoscaler(namespace, &hpa).await?;
            info!(
                name = %hpa.name_any(),
                min = targets.min_replicas,
                max = targets.max_replicas,
                target = targets.target_cpu_utilization_percentage,
                "Updated autoscaler"
            );
            update.hpa_name(hpa.name_any());
            Ok(StepOutcome::Updated)
        }
        (AutoscalerAction::Delete, Some(hpa), _) => {
            ctx.store
                .delete_autoscaler(namespace, &hpa.name_any())
                .await?;
            info!(name = %hpa.name_any(), "Deleted autoscaler");
            update.hpa_name("");
            Ok(StepOutcome::Deleted)
        }
        (AutoscalerAction::Keep, Some(hpa), _) => {
            update.hpa_name(hpa.name_any());
            Ok(StepOutcome::Unchanged)
        }
        _ => {
            update.hpa_name("");
            Ok(StepOutcome::Unchanged)
        }
    }
}
