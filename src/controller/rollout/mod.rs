pub mod gating;
pub mod machine;
pub mod progress;
pub mod steps;
pub mod sync;

use std::collections::HashMap;

use chrono::Utc;
use kube::ResourceExt;
use kube::api::Api;
use tracing::{info, warn};

use super::{ReconcileErr, conditions, status};
use crate::crd::app_set::ApplicationSet;
use crate::crd::application::Application;

pub use sync::overlay_sync_operations;

/// One full progressive-sync pass: assign members to steps, advance every
/// member's state machine, gate steps, promote within maxUpdate, and
/// refresh the rollout condition. Returns the allow-to-sync map consumed
/// by the sync-trigger overlay.
pub async fn perform_progressive_syncs(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
    current: &[Application],
    desired: &[Application],
    app_map: &HashMap<String, Application>,
) -> Result<HashMap<String, bool>, ReconcileErr> {
    let (step_members, step_index) =
        steps::build_step_assignments(appset, desired);

    let now = Utc::now().to_rfc3339();
    let progressive = appset.progressive_sync_enabled();
    let statuses: Vec<_> = current
        .iter()
        .map(|app| {
            let name = app.name_any();
            machine::next_application_status(
                &name,
                appset.find_application_status(&name),
                &machine::AppObservation::from_app(app),
                steps::app_step(&name, &step_index),
                progressive,
                &now,
            )
        })
        .collect();
    status::set_application_statuses(api, appset, statuses).await?;

    for (i, members) in step_members.iter().enumerate() {
        info!(step = i + 1, ?members, "rollout step membership");
    }

    let sync_map = gating::build_app_sync_map(appset, &step_members, app_map);
    info!(?sync_map, "applications allowed to sync before maxUpdate");

    let current_statuses = appset
        .status
        .as_ref()
        .map(|s| s.application_status.clone())
        .unwrap_or_default();
    let promoted = gating::promote_waiting_to_pending(
        appset,
        &current_statuses,
        &sync_map,
        &step_index,
        &now,
    );
    status::set_application_statuses(api, appset, promoted).await?;

    if let Some(condition) = progress::rollout_progress_condition(appset) {
        if let Err(err) =
            conditions::set_status_condition(api, appset, condition, true)
                .await
        {
            warn!(error = %err, "failed to update rollout progress condition");
        }
    }

    Ok(sync_map)
}

#[cfg(test)]
mod machine_tests;
#[cfg(test)]
mod steps_tests;
