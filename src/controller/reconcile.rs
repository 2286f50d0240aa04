use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use super::conditions::{
    self, REASON_APPLICATION_GENERATION_FROM_PARAMS_ERROR,
    REASON_APPLICATION_SET_UP_TO_DATE, REASON_APPLICATION_VALIDATION_ERROR,
    REASON_CREATE_APPLICATION_ERROR, REASON_DELETE_APPLICATION_ERROR,
    REASON_REFRESH_APPLICATION_ERROR, REASON_RENDER_TEMPLATE_PARAMS_ERROR,
    REASON_UPDATE_APPLICATION_ERROR, error_condition,
};
use super::{
    ControllerContext, ReconcileErr, deletion, materializer, retry, rollout,
    status,
};
use crate::crd::app_project::AppProject;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetCondition, ApplicationSetConditionType,
    ConditionStatus, REFRESH_ANNOTATION,
};
use crate::crd::application::{Application, RESOURCES_FINALIZER};
use crate::generators::GeneratorErr;
use crate::resolver;
use crate::templates::{RenderErr, TemplateMode, render_application};

/// Back-off applied whenever generation or validation fails; watch events
/// still reconcile sooner.
const VALIDATION_REQUEUE: Duration = Duration::from_secs(180);

#[derive(thiserror::Error, Debug)]
enum GenerateErr {
    #[error("generator failed: {0}")]
    Generator(#[from] GeneratorErr),
    #[error("failed to render template: {0}")]
    Render(#[from] RenderErr),
}

/// Reconciler entry point. Panics inside a reconcile must never tear
/// down the worker, so the inner future runs behind a panic guard and a
/// panic surfaces as an ordinary error.
pub async fn reconcile(
    appset: Arc<ApplicationSet>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    match AssertUnwindSafe(reconcile_inner(appset, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(%message, "recovered from panic in reconcile");
            Err(ReconcileErr::Internal(format!(
                "recovered from panic: {message}"
            )))
        }
    }
}

#[instrument(skip_all, fields(
    ns = %appset.namespace().unwrap_or_else(|| "default".into()),
    name = %appset.name_any(),
))]
async fn reconcile_inner(
    appset: Arc<ApplicationSet>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let namespace = appset.namespace().unwrap_or_else(|| "default".into());
    let name = appset.name_any();
    let api: Api<ApplicationSet> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let mut appset = (*appset).clone();
    let mut parameters_generated = false;

    if appset.metadata.deletion_timestamp.is_some() {
        return deletion::handle_deletion(&ctx, &api, &appset).await;
    }

    ensure_finalizer(&api, &appset).await?;
    status::migrate_status(&api, &mut appset).await?;

    let generated = match generate_applications(&ctx, &appset).await {
        Ok(apps) => apps,
        Err(err) => {
            warn!(error = %err, "unable to generate applications");
            let reason = match &err {
                GenerateErr::Render(_) => REASON_RENDER_TEMPLATE_PARAMS_ERROR,
                GenerateErr::Generator(_) => {
                    REASON_APPLICATION_GENERATION_FROM_PARAMS_ERROR
                }
            };
            set_condition_logged(
                &api,
                &mut appset,
                error_condition(reason, err.to_string()),
                parameters_generated,
            )
            .await;
            // swallow the error so the harness honours the requeue
            return Ok(Action::requeue(VALIDATION_REQUEUE));
        }
    };
    parameters_generated = true;

    let validate_errors =
        match validate_generated_applications(&ctx, &generated, &appset).await
        {
            Ok(errors) => errors,
            Err(err) => {
                // transient lookups may recover on their own, requeue
                warn!(error = %err, "error occurred during application validation");
                set_condition_logged(
                    &api,
                    &mut appset,
                    error_condition(
                        REASON_APPLICATION_VALIDATION_ERROR,
                        err.to_string(),
                    ),
                    parameters_generated,
                )
                .await;
                return Ok(Action::requeue(VALIDATION_REQUEUE));
            }
        };

    let current =
        materializer::get_current_applications(&ctx.client, &appset).await?;
    status::update_resources_status(&api, &mut appset, &current).await?;

    let mut app_map: HashMap<String, Application> = HashMap::new();
    let mut app_sync_map: HashMap<String, bool> = HashMap::new();
    if ctx.cfg.enable_progressive_syncs {
        let recorded = appset
            .status
            .as_ref()
            .map(|s| s.application_status.len())
            .unwrap_or(0);
        if !appset.is_rolling_sync() && recorded > 0 {
            // strategy switched away from RollingSync; drop the bookkeeping
            info!(
                entries = recorded,
                "removing application status entries now that RollingSync is off"
            );
            status::set_application_statuses(&api, &mut appset, Vec::new())
                .await?;
        } else if appset.is_rolling_sync() {
            for app in &current {
                app_map.insert(app.name_any(), app.clone());
            }
            app_sync_map = rollout::perform_progressive_syncs(
                &api, &mut appset, &current, &generated, &app_map,
            )
            .await?;
        }
    }

    let mut valid_apps: Vec<Application> = generated
        .iter()
        .filter(|app| !validate_errors.contains_key(&app.qualified_name()))
        .cloned()
        .collect();

    if !validate_errors.is_empty() {
        let mut failed: Vec<&String> = validate_errors.keys().collect();
        failed.sort();
        let mut message = String::new();
        for app in &failed {
            message = validate_errors[*app].clone();
            error!(application = %app, %message, "validation error found during application validation");
        }
        if validate_errors.len() > 1 {
            // only the last message lands in status, to keep it bounded
            message =
                format!("{message} (and {} more)", validate_errors.len() - 1);
        }
        set_condition_logged(
            &api,
            &mut appset,
            error_condition(REASON_APPLICATION_VALIDATION_ERROR, message),
            parameters_generated,
        )
        .await;
    }

    if ctx.cfg.enable_progressive_syncs && appset.progressive_sync_enabled() {
        valid_apps = rollout::overlay_sync_operations(
            &appset,
            &app_sync_map,
            &app_map,
            valid_apps,
        );
    }

    let policy =
        appset.effective_policy(ctx.cfg.policy, ctx.cfg.enable_policy_override);
    if policy.allow_update() {
        if let Err(err) =
            materializer::create_or_update_in_cluster(&ctx, &appset, valid_apps)
                .await
        {
            set_condition_logged(
                &api,
                &mut appset,
                error_condition(
                    REASON_UPDATE_APPLICATION_ERROR,
                    err.to_string(),
                ),
                parameters_generated,
            )
            .await;
            return Err(err);
        }
    } else if let Err(err) =
        materializer::create_in_cluster(&ctx, &appset, valid_apps).await
    {
        set_condition_logged(
            &api,
            &mut appset,
            error_condition(REASON_CREATE_APPLICATION_ERROR, err.to_string()),
            parameters_generated,
        )
        .await;
        return Err(err);
    }

    if policy.allow_delete() {
        if let Err(err) =
            materializer::delete_in_cluster(&ctx, &appset, &generated).await
        {
            set_condition_logged(
                &api,
                &mut appset,
                error_condition(
                    REASON_DELETE_APPLICATION_ERROR,
                    err.to_string(),
                ),
                parameters_generated,
            )
            .await;
            return Err(err);
        }
    }

    if appset.refresh_requested() {
        if let Err(err) = acknowledge_refresh(&api, &name).await {
            warn!(error = %err, "error occurred while clearing the refresh annotation");
            set_condition_logged(
                &api,
                &mut appset,
                error_condition(
                    REASON_REFRESH_APPLICATION_ERROR,
                    err.to_string(),
                ),
                parameters_generated,
            )
            .await;
            return Err(err.into());
        }
    }

    let mut requeue_after = ctx.generators.min_requeue_after(&appset);
    if validate_errors.is_empty() {
        conditions::set_status_condition(
            &api,
            &mut appset,
            ApplicationSetCondition {
                type_: ApplicationSetConditionType::ResourcesUpToDate,
                status: ConditionStatus::True,
                reason: REASON_APPLICATION_SET_UP_TO_DATE.into(),
                message: "All applications have been generated successfully"
                    .into(),
                last_transition_time: None,
            },
            parameters_generated,
        )
        .await?;
    } else if requeue_after.is_none() {
        requeue_after = Some(VALIDATION_REQUEUE);
    }

    info!(?requeue_after, "end reconcile");
    Ok(match requeue_after {
        Some(duration) => Action::requeue(duration),
        None => Action::await_change(),
    })
}

/// Condition writes are best-effort inside a reconcile; the next pass
/// recomputes them from scratch.
async fn set_condition_logged(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
    condition: ApplicationSetCondition,
    parameters_generated: bool,
) {
    if let Err(err) = conditions::set_status_condition(
        api,
        appset,
        condition,
        parameters_generated,
    )
    .await
    {
        warn!(error = %err, "unable to set application set condition");
    }
}

async fn ensure_finalizer(
    api: &Api<ApplicationSet>,
    appset: &ApplicationSet,
) -> Result<(), kube::Error> {
    if appset
        .finalizers()
        .iter()
        .any(|f| f == RESOURCES_FINALIZER)
    {
        return Ok(());
    }
    info!("adding resources finalizer");
    let mut finalizers = appset.finalizers().to_vec();
    finalizers.push(RESOURCES_FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &appset.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Clear the refresh annotation, acknowledging the forced reconcile.
async fn acknowledge_refresh(
    api: &Api<ApplicationSet>,
    name: &str,
) -> Result<(), kube::Error> {
    let patch =
        json!({"metadata": {"annotations": {REFRESH_ANNOTATION: null}}});
    retry::retry_on_conflict(|| async {
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    })
    .await
}

/// Run every generator on the parent and render the combined desired
/// member list.
async fn generate_applications(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
) -> Result<Vec<Application>, GenerateErr> {
    let mode = TemplateMode::for_app_set(appset);
    let mut apps = Vec::new();
    for gen_spec in &appset.spec.generators {
        let relevant = ctx.generators.relevant(gen_spec);
        if relevant.is_empty() {
            warn!("generator entry matches no known generator; skipping");
            continue;
        }
        for generator in relevant {
            let params = generator
                .generate_params(gen_spec, appset, &ctx.client)
                .await?;
            let template = generator
                .get_template(gen_spec)
                .unwrap_or(&appset.spec.template);
            for param_map in &params {
                let mut app =
                    render_application(template, param_map, mode, appset)?;
                app.spec =
                    materializer::normalize_application_spec(app.spec);
                apps.push(app);
            }
        }
    }
    info!(count = apps.len(), "generated applications");
    Ok(apps)
}

/// Per-member validation: unique names, an existing project, and a
/// resolvable destination. Failures are per-member; a failed lookup of
/// the validation inputs themselves is a hard error.
async fn validate_generated_applications(
    ctx: &ControllerContext,
    apps: &[Application],
    appset: &ApplicationSet,
) -> Result<HashMap<String, String>, ReconcileErr> {
    let mut errors = HashMap::new();
    let mut names: HashSet<String> = HashSet::new();
    let clusters = resolver::list_clusters(
        ctx.client.clone(),
        &ctx.cfg.control_namespace,
    )
    .await?;
    let projects: Api<AppProject> =
        Api::namespaced(ctx.client.clone(), &ctx.cfg.control_namespace);

    for app in apps {
        let name = app.name_any();
        if !names.insert(name.clone()) {
            errors.insert(
                app.qualified_name(),
                format!(
                    "ApplicationSet {} contains applications with duplicate name: {}",
                    appset.name_any(),
                    name
                ),
            );
            continue;
        }
        if projects.get_opt(&app.spec.project).await?.is_none() {
            errors.insert(
                app.qualified_name(),
                format!(
                    "application references project {} which does not exist",
                    app.spec.project
                ),
            );
            continue;
        }
        if let Err(err) =
            resolver::resolve_destination(&app.spec.destination, &clusters)
        {
            errors.insert(
                app.qualified_name(),
                format!("application destination spec is invalid: {err}"),
            );
        }
    }
    Ok(errors)
}
