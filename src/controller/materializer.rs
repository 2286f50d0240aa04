use std::collections::{BTreeSet, HashSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::events::{
    REASON_CREATED, REASON_DELETED, REASON_UPDATED, build_obj_ref, emit_event,
};
use super::retry::retry_on_conflict;
use super::{ControllerContext, ReconcileErr};
use crate::config::ControllerConfig;
use crate::crd::app_set::{
    ApplicationSet, IgnoreDifference, NOTIFIED_ANNOTATION,
};
use crate::crd::application::{
    Application, ApplicationSpec, POST_DELETE_FINALIZER_PREFIX,
    RESOURCES_FINALIZER,
};
use crate::resolver::{self, ClusterSpecifier};

/// Annotation that asks the application controller for a refresh; user
/// tooling sets it, so re-renders must not wipe it.
const APP_REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";

const DEFAULT_PRESERVED_ANNOTATIONS: [&str; 2] =
    [NOTIFIED_ANNOTATION, APP_REFRESH_ANNOTATION];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Annotation and label keys owned by parties other than this controller,
/// copied from the live object into every re-render. Built once per
/// reconcile from the parent spec, the controller globals, and the
/// built-in defaults.
pub struct PreservedKeys {
    annotations: BTreeSet<String>,
    labels: BTreeSet<String>,
}

impl PreservedKeys {
    pub fn for_reconcile(
        appset: &ApplicationSet,
        cfg: &ControllerConfig,
    ) -> Self {
        let mut annotations: BTreeSet<String> = DEFAULT_PRESERVED_ANNOTATIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut labels = BTreeSet::new();
        if let Some(preserved) = appset.spec.preserved_fields.as_ref() {
            annotations.extend(preserved.annotations.iter().cloned());
            labels.extend(preserved.labels.iter().cloned());
        }
        annotations.extend(cfg.global_preserved_annotation_keys());
        labels.extend(cfg.global_preserved_label_keys());
        Self {
            annotations,
            labels,
        }
    }
}

/// Defaulting applied to every desired spec before compare, so renders
/// do not fight the application controller over implied values.
pub fn normalize_application_spec(mut spec: ApplicationSpec) -> ApplicationSpec {
    if spec.project.is_empty() {
        spec.project = "default".into();
    }
    spec
}

fn controller_reference(appset: &ApplicationSet) -> OwnerReference {
    OwnerReference {
        api_version: "argoproj.io/v1alpha1".into(),
        kind: "ApplicationSet".into(),
        name: appset.name_any(),
        uid: appset.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn is_owned_by(app: &Application, appset: &ApplicationSet) -> bool {
    app.owner_references().iter().any(|or| {
        or.controller == Some(true)
            && or.kind == "ApplicationSet"
            && or.api_version.starts_with("argoproj.io/")
            && or.name == appset.name_any()
    })
}

/// The live members this parent controls, via the controller owner
/// reference on each application in the parent's namespace.
pub async fn get_current_applications(
    client: &Client,
    appset: &ApplicationSet,
) -> Result<Vec<Application>, kube::Error> {
    let namespace = appset.namespace().unwrap_or_else(|| "default".into());
    let api: Api<Application> = Api::namespaced(client.clone(), &namespace);
    let list = api.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|app| is_owned_by(app, appset))
        .collect())
}

/// Build the object an update would write: the desired spec and owned
/// metadata layered over the live object, with externally-owned keys and
/// post-delete finalizers carried over from the live side.
pub fn merge_application(
    appset: &ApplicationSet,
    preserved: &PreservedKeys,
    live: &Application,
    desired: &Application,
) -> Application {
    let mut merged = live.clone();
    merged.spec = normalize_application_spec(desired.spec.clone());

    // a one-shot operation may be layered on; never clear one the
    // application controller is still consuming
    if desired.operation.is_some() {
        merged.operation = desired.operation.clone();
    }

    let mut annotations =
        desired.metadata.annotations.clone().unwrap_or_default();
    for key in &preserved.annotations {
        if let Some(value) = live.annotations().get(key) {
            annotations.insert(key.clone(), value.clone());
        }
    }
    merged.metadata.annotations =
        (!annotations.is_empty()).then_some(annotations);

    let mut labels = desired.metadata.labels.clone().unwrap_or_default();
    for key in &preserved.labels {
        if let Some(value) = live.labels().get(key) {
            labels.insert(key.clone(), value.clone());
        }
    }
    merged.metadata.labels = (!labels.is_empty()).then_some(labels);

    let mut finalizers =
        desired.metadata.finalizers.clone().unwrap_or_default();
    for finalizer in live.finalizers() {
        if finalizer.starts_with(POST_DELETE_FINALIZER_PREFIX)
            && !finalizers.contains(finalizer)
        {
            finalizers.push(finalizer.clone());
        }
    }
    merged.metadata.finalizers =
        (!finalizers.is_empty()).then_some(finalizers);

    merged.metadata.owner_references =
        Some(vec![controller_reference(appset)]);
    merged
}

fn unescape_pointer_key(key: &str) -> String {
    key.replace("~1", "/").replace("~0", "~")
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some(idx) = pointer.rfind('/') else {
        return;
    };
    let (parent, key) = pointer.split_at(idx);
    let key = unescape_pointer_key(&key[1..]);
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    match target {
        Some(Value::Object(map)) => {
            map.remove(&key);
        }
        Some(Value::Array(items)) => {
            if let Ok(i) = key.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

fn spec_for_compare(
    spec: &ApplicationSpec,
    ignore: &[IgnoreDifference],
) -> Value {
    let mut value = serde_json::to_value(spec).unwrap_or(Value::Null);
    for rule in ignore {
        for pointer in &rule.json_pointers {
            remove_pointer(&mut value, pointer);
        }
    }
    value
}

/// Content-based diff over the fields this controller owns. Status never
/// participates; ignore-difference pointers are dropped from both sides
/// of the spec first.
pub fn application_changed(
    live: &Application,
    merged: &Application,
    ignore: &[IgnoreDifference],
) -> bool {
    if spec_for_compare(&live.spec, ignore)
        != spec_for_compare(&merged.spec, ignore)
    {
        return true;
    }
    if live.operation != merged.operation {
        return true;
    }
    let maps_differ = live.metadata.labels.clone().unwrap_or_default()
        != merged.metadata.labels.clone().unwrap_or_default()
        || live.metadata.annotations.clone().unwrap_or_default()
            != merged.metadata.annotations.clone().unwrap_or_default()
        || live.metadata.finalizers.clone().unwrap_or_default()
            != merged.metadata.finalizers.clone().unwrap_or_default();
    if maps_differ {
        return true;
    }
    live.metadata.owner_references.clone().unwrap_or_default()
        != merged.metadata.owner_references.clone().unwrap_or_default()
}

async fn apply_application(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    desired: &Application,
) -> Result<OperationResult, kube::Error> {
    let namespace = desired
        .metadata
        .namespace
        .clone()
        .or_else(|| appset.namespace())
        .unwrap_or_else(|| "default".into());
    let name = desired.name_any();
    let api: Api<Application> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let preserved = PreservedKeys::for_reconcile(appset, &ctx.cfg);

    retry_on_conflict(|| async {
        match api.get_opt(&name).await? {
            None => {
                let mut app = desired.clone();
                app.spec = normalize_application_spec(app.spec);
                app.metadata.owner_references =
                    Some(vec![controller_reference(appset)]);
                api.create(&PostParams::default(), &app).await?;
                Ok(OperationResult::Created)
            }
            Some(live) => {
                let merged =
                    merge_application(appset, &preserved, &live, desired);
                if !application_changed(
                    &live,
                    &merged,
                    &appset.spec.ignore_application_differences,
                ) {
                    return Ok(OperationResult::Unchanged);
                }
                api.replace(&name, &PostParams::default(), &merged).await?;
                Ok(OperationResult::Updated)
            }
        }
    })
    .await
}

/// Create or update every desired member. Per-member failures are
/// collected; the first one is returned after the loop so a bad member
/// does not block its siblings.
pub async fn create_or_update_in_cluster(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    desired: Vec<Application>,
) -> Result<(), ReconcileErr> {
    let obj_ref = build_obj_ref(appset);
    let mut first_error: Option<ReconcileErr> = None;

    for app in &desired {
        let name = app.name_any();
        match apply_application(ctx, appset, app).await {
            Ok(OperationResult::Unchanged) => {
                debug!(application = %name, "application unchanged");
            }
            Ok(result) => {
                let reason = match result {
                    OperationResult::Created => REASON_CREATED,
                    _ => REASON_UPDATED,
                };
                info!(application = %name, ?result, "applied application");
                emit_event(
                    &ctx.recorder,
                    &obj_ref,
                    reason,
                    "Apply",
                    Some(format!("{reason} Application {name:?}")),
                )
                .await;
            }
            Err(err) => {
                error!(application = %name, error = %err, "failed to apply application");
                if first_error.is_none() {
                    first_error = Some(err.into());
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Create-only flavor: filter the desired set down to names that do not
/// exist yet, then run the normal apply path on those.
pub async fn create_in_cluster(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    desired: Vec<Application>,
) -> Result<(), ReconcileErr> {
    let current = get_current_applications(&ctx.client, appset).await?;
    let existing: HashSet<String> =
        current.iter().map(|a| a.name_any()).collect();
    let new_apps: Vec<Application> = desired
        .into_iter()
        .filter(|a| !existing.contains(&a.name_any()))
        .collect();
    create_or_update_in_cluster(ctx, appset, new_apps).await
}

/// Delete live members that fell out of the desired set, fixing up the
/// resources finalizer first when the destination no longer resolves.
pub async fn delete_in_cluster(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    desired: &[Application],
) -> Result<(), ReconcileErr> {
    let clusters = resolver::list_clusters(
        ctx.client.clone(),
        &ctx.cfg.control_namespace,
    )
    .await?;
    let current = get_current_applications(&ctx.client, appset).await?;
    let keep: HashSet<String> =
        desired.iter().map(|a| a.name_any()).collect();
    let obj_ref = build_obj_ref(appset);

    let mut first_error: Option<ReconcileErr> = None;
    for app in &current {
        let name = app.name_any();
        if keep.contains(&name) {
            continue;
        }
        if let Err(err) =
            remove_finalizer_on_invalid_destination(ctx, appset, app, &clusters)
                .await
        {
            error!(application = %name, error = %err, "failed to update application before deletion");
            if first_error.is_none() {
                first_error = Some(err.into());
            }
            continue;
        }
        let namespace = app
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".into());
        let api: Api<Application> =
            Api::namespaced(ctx.client.clone(), &namespace);
        if let Err(err) = api.delete(&name, &DeleteParams::default()).await {
            error!(application = %name, error = %err, "failed to delete application");
            if first_error.is_none() {
                first_error = Some(err.into());
            }
            continue;
        }
        info!(application = %name, "deleted application");
        emit_event(
            &ctx.recorder,
            &obj_ref,
            REASON_DELETED,
            "Delete",
            Some(format!("Deleted Application {name:?}")),
        )
        .await;
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Which finalizers survive when the destination cannot be resolved: the
/// resources finalizer would stall deletion against an unreachable
/// cluster, so exactly that entry is dropped.
pub fn finalizers_without_stale_resources_entry(
    app: &Application,
    clusters: &[ClusterSpecifier],
) -> Option<Vec<String>> {
    if app.finalizers().is_empty() {
        return None;
    }
    if let Err(err) =
        resolver::resolve_destination(&app.spec.destination, clusters)
    {
        warn!(
            application = %app.name_any(),
            error = %err,
            "application destination cannot be resolved"
        );
        let remaining: Vec<String> = app
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != RESOURCES_FINALIZER)
            .cloned()
            .collect();
        if remaining.len() != app.finalizers().len() {
            return Some(remaining);
        }
    }
    None
}

async fn remove_finalizer_on_invalid_destination(
    ctx: &ControllerContext,
    appset: &ApplicationSet,
    app: &Application,
    clusters: &[ClusterSpecifier],
) -> Result<(), kube::Error> {
    let Some(remaining) =
        finalizers_without_stale_resources_entry(app, clusters)
    else {
        return Ok(());
    };
    let namespace = app
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".into());
    let api: Api<Application> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({"metadata": {"finalizers": remaining}});
    api.patch(
        &app.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(
        application = %app.name_any(),
        "removed resources finalizer before deletion, application has an invalid destination"
    );
    emit_event(
        &ctx.recorder,
        &build_obj_ref(appset),
        REASON_UPDATED,
        "Update",
        Some(format!(
            "Updated Application {:?} finalizer before deletion, because application has an invalid destination",
            app.name_any()
        )),
    )
    .await;
    Ok(())
}
