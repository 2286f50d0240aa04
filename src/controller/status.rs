use kube::ResourceExt;
use kube::api::Api;
use tracing::{debug, trace};

use super::retry::update_status_on_conflict;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetApplicationStatus, ResourceStatus,
};
use crate::crd::application::Application;

/// One-shot defaulting of older status layouts: entries written before
/// target revisions were tracked carry none, and later status writes
/// would be rejected without the field. Persists only when something
/// actually changed.
pub async fn migrate_status(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
) -> Result<(), kube::Error> {
    let mut changed = false;
    if let Some(status) = appset.status.as_mut() {
        for entry in status.application_status.iter_mut() {
            if entry.target_revisions.is_none() {
                entry.target_revisions = Some(Vec::new());
                changed = true;
            }
        }
    }
    if !changed {
        return Ok(());
    }

    debug!(appset = %appset.name_any(), "migrating status subresource");
    let migrated = appset
        .status
        .as_ref()
        .map(|s| s.application_status.clone())
        .unwrap_or_default();
    let updated = update_status_on_conflict(api, &appset.name_any(), |latest| {
        latest
            .status
            .get_or_insert_with(Default::default)
            .application_status = migrated.clone();
    })
    .await?;
    if let Some(updated) = updated {
        *appset = updated;
    }
    Ok(())
}

/// Per-member health/sync summary, sorted by name for stable writes.
pub fn build_resource_statuses(
    applications: &[Application],
) -> Vec<ResourceStatus> {
    let mut statuses: Vec<ResourceStatus> = applications
        .iter()
        .map(|app| ResourceStatus {
            name: app.name_any(),
            namespace: app.metadata.namespace.clone(),
            status: Some(app.sync_status()),
            health: Some(app.health_status()),
        })
        .collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    statuses
}

/// Refresh `status.resources` from the live member set; skipped entirely
/// when nothing changed so steady-state reconciles stay write-free.
pub async fn update_resources_status(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
    applications: &[Application],
) -> Result<(), kube::Error> {
    let statuses = build_resource_statuses(applications);
    let current = appset
        .status
        .as_ref()
        .map(|s| s.resources.as_slice())
        .unwrap_or_default();
    if current == statuses.as_slice() {
        trace!("resource statuses unchanged; skipping status write");
        return Ok(());
    }

    let updated = update_status_on_conflict(api, &appset.name_any(), |latest| {
        latest
            .status
            .get_or_insert_with(Default::default)
            .resources = statuses.clone();
    })
    .await?;
    if let Some(updated) = updated {
        *appset = updated;
    } else {
        appset
            .status
            .get_or_insert_with(Default::default)
            .resources = statuses;
    }
    Ok(())
}

fn application_statuses_differ(
    current: &[ApplicationSetApplicationStatus],
    desired: &[ApplicationSetApplicationStatus],
) -> bool {
    if current.len() != desired.len() {
        return true;
    }
    desired.iter().any(|d| {
        match current.iter().find(|c| c.application == d.application) {
            None => true,
            Some(c) => {
                c.message != d.message
                    || c.status != d.status
                    || c.step != d.step
            }
        }
    })
}

/// Replace the per-application rollout bookkeeping, sorted by application
/// name; no write happens when nothing material changed.
pub async fn set_application_statuses(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
    statuses: Vec<ApplicationSetApplicationStatus>,
) -> Result<(), kube::Error> {
    let current = appset
        .status
        .as_ref()
        .map(|s| s.application_status.as_slice())
        .unwrap_or_default();
    if !application_statuses_differ(current, &statuses) {
        trace!("application statuses unchanged; skipping status write");
        return Ok(());
    }

    let mut sorted = statuses;
    sorted.sort_by(|a, b| a.application.cmp(&b.application));

    let updated = update_status_on_conflict(api, &appset.name_any(), |latest| {
        latest
            .status
            .get_or_insert_with(Default::default)
            .application_status = sorted.clone();
    })
    .await?;
    match updated {
        Some(updated) => *appset = updated,
        None => {
            appset
                .status
                .get_or_insert_with(Default::default)
                .application_status = sorted;
        }
    }
    Ok(())
}
