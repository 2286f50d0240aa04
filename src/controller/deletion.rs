use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::materializer::get_current_applications;
use super::retry::retry_on_conflict;
use super::rollout::steps::build_step_assignments;
use super::{ControllerContext, ReconcileErr};
use crate::crd::app_set::ApplicationSet;
use crate::crd::application::{Application, RESOURCES_FINALIZER};

const REVERSE_DELETION_REQUEUE: Duration = Duration::from_secs(10);
const STUCK_DELETION_LIMIT_MINUTES: i64 = 2;

struct DeleteInOrder {
    name: String,
    step: usize,
}

/// Teardown entry point, invoked once the parent carries a deletion
/// timestamp. Ordering: release children when the policy forbids
/// deleting them, drain steps in reverse when requested, and only then
/// drop the parent's finalizer so garbage collection may proceed.
pub async fn handle_deletion(
    ctx: &ControllerContext,
    api: &Api<ApplicationSet>,
    appset: &ApplicationSet,
) -> Result<Action, ReconcileErr> {
    let name = appset.name_any();
    info!(appset = %name, "deletion timestamp detected, starting teardown");

    let policy =
        appset.effective_policy(ctx.cfg.policy, ctx.cfg.enable_policy_override);
    if !policy.allow_delete() {
        debug!(appset = %name, "policy does not allow delete, releasing applications");
        remove_owner_references(ctx, appset).await?;
    }

    if appset.reverse_deletion_order() {
        debug!(appset = %name, "reverse deletion order requested");
        let current = get_current_applications(&ctx.client, appset).await?;
        if let Some(requeue) =
            perform_reverse_deletion(ctx, appset, &current).await?
        {
            return Ok(Action::requeue(requeue));
        }
    }

    if appset
        .finalizers()
        .iter()
        .any(|f| f == RESOURCES_FINALIZER)
    {
        info!(appset = %name, "removing resources finalizer");
        let finalizers: Vec<String> = appset
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != RESOURCES_FINALIZER)
            .cloned()
            .collect();
        let patch = json!({"metadata": {"finalizers": finalizers}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    Ok(Action::await_change())
}

/// Strip owner references from every member so they outlive the parent.
async fn remove_owner_references(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
) -> Result<(), ReconcileErr> {
    let current = get_current_applications(&ctx.client, appset).await?;
    for app in current {
        let namespace = app
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".into());
        let name = app.name_any();
        let api: Api<Application> =
            Api::namespaced(ctx.client.clone(), &namespace);
        retry_on_conflict(|| async {
            let mut latest = match api.get_opt(&name).await? {
                Some(app) => app,
                None => return Ok(()),
            };
            latest.metadata.owner_references = Some(Vec::new());
            api.replace(&name, &Default::default(), &latest).await?;
            Ok(())
        })
        .await?;
        info!(application = %name, "removed owner references");
    }
    Ok(())
}

/// Walk members in reverse step order and initiate at most one deletion
/// per reconcile; the caller requeues until every step has drained. A
/// member stuck in deletion past the limit is a hard error.
pub async fn perform_reverse_deletion(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    current: &[Application],
) -> Result<Option<Duration>, ReconcileErr> {
    let step_count =
        appset.rolling_sync_steps().map(|s| s.len()).unwrap_or(0);
    let (_, step_index) = build_step_assignments(appset, current);

    let namespaces: HashMap<String, String> = current
        .iter()
        .map(|app| {
            (
                app.name_any(),
                app.metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| "default".into()),
            )
        })
        .collect();

    let mut order: Vec<DeleteInOrder> = step_index
        .iter()
        .map(|(name, &step)| DeleteInOrder {
            name: name.clone(),
            step: step_count - step - 1,
        })
        .collect();
    order.sort_by(|a, b| a.step.cmp(&b.step).then(a.name.cmp(&b.name)));

    for item in &order {
        debug!(step = item.step, application = %item.name, "reverse deletion walk");
        let namespace = namespaces
            .get(&item.name)
            .cloned()
            .unwrap_or_else(|| "default".into());
        let api: Api<Application> =
            Api::namespaced(ctx.client.clone(), &namespace);
        let Some(retrieved) = api.get_opt(&item.name).await? else {
            info!(application = %item.name, "application successfully deleted");
            continue;
        };
        if let Some(ts) = retrieved.meta().deletion_timestamp.as_ref() {
            info!(
                application = %item.name,
                "application has been marked for deletion, but object not removed yet"
            );
            let waited = Utc::now().signed_duration_since(ts.0);
            if waited > chrono::Duration::minutes(STUCK_DELETION_LIMIT_MINUTES)
            {
                return Err(ReconcileErr::Orchestration(format!(
                    "application {} has not been deleted in over {} minutes",
                    item.name, STUCK_DELETION_LIMIT_MINUTES
                )));
            }
            return Ok(Some(REVERSE_DELETION_REQUEUE));
        }
        api.delete(&item.name, &DeleteParams::default()).await?;
        info!(application = %item.name, "initiated deletion");
        return Ok(Some(REVERSE_DELETION_REQUEUE));
    }

    info!(appset = %appset.name_any(), "completed reverse deletion");
    Ok(None)
}
