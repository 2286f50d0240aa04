use tracing::info;

use crate::crd::app_set::{ApplicationSetApplicationStatus, RolloutPhase};
use crate::crd::application::{
    Application, HealthStatusCode, OperationPhase, SyncStatusCode,
};

/// What the application controller currently reports for one member;
/// separated from the recorded rollout state so the transition rules stay
/// pure functions.
#[derive(Clone, Debug, Default)]
pub struct AppObservation {
    pub health: HealthStatusCode,
    pub sync: SyncStatusCode,
    pub operation_phase: Option<OperationPhase>,
    pub target_revisions: Vec<String>,
}

impl AppObservation {
    pub fn from_app(app: &Application) -> Self {
        Self {
            health: app.health_status(),
            sync: app.sync_status(),
            operation_phase: app.operation_phase(),
            target_revisions: app.target_revisions(),
        }
    }
}

/// Healthy, in sync, and with no operation in flight (or the last one
/// succeeded).
pub fn is_application_healthy(obs: &AppObservation) -> bool {
    obs.health == HealthStatusCode::Healthy
        && obs.sync != SyncStatusCode::OutOfSync
        && matches!(
            obs.operation_phase,
            None | Some(OperationPhase::Succeeded)
        )
}

/// Advance one member's rollout status. Rules are evaluated top-down and
/// every transition stamps the transition time and the current step.
pub fn next_application_status(
    name: &str,
    prev: Option<&ApplicationSetApplicationStatus>,
    obs: &AppObservation,
    step: i64,
    progressive: bool,
    now: &str,
) -> ApplicationSetApplicationStatus {
    let mut current = match prev {
        None => ApplicationSetApplicationStatus {
            application: name.to_string(),
            step,
            status: RolloutPhase::Waiting,
            message: "No Application status found, defaulting status to \
                      Waiting."
                .into(),
            last_transition_time: Some(now.to_string()),
            target_revisions: None,
        },
        Some(prev) => {
            let mut current = prev.clone();
            if current.target_revisions.as_deref()
                != Some(obs.target_revisions.as_slice())
            {
                current.message = "Application has pending changes, setting \
                                   status to Waiting."
                    .into();
            }
            current
        }
    };

    if current.target_revisions.as_deref()
        != Some(obs.target_revisions.as_slice())
    {
        current.target_revisions = Some(obs.target_revisions.clone());
        current.status = RolloutPhase::Waiting;
        current.last_transition_time = Some(now.to_string());
        current.step = step;
    }

    let outdated = progressive && obs.sync == SyncStatusCode::OutOfSync;

    if outdated
        && current.status != RolloutPhase::Waiting
        && current.status != RolloutPhase::Pending
    {
        info!(application = %name, "application is outdated, moving back to Waiting");
        current.status = RolloutPhase::Waiting;
        current.message =
            "Application has pending changes, setting status to Waiting."
                .into();
        current.last_transition_time = Some(now.to_string());
        current.step = step;
    }

    if current.status == RolloutPhase::Pending {
        if !outdated && obs.operation_phase == Some(OperationPhase::Succeeded)
        {
            info!(application = %name, "sync completed, moving to Progressing");
            current.status = RolloutPhase::Progressing;
            current.message = "Application resource completed a sync \
                               successfully, updating status from Pending to \
                               Progressing."
                .into();
            current.last_transition_time = Some(now.to_string());
            current.step = step;
        } else if obs.operation_phase == Some(OperationPhase::Running)
            || obs.health == HealthStatusCode::Progressing
        {
            info!(application = %name, "application started progressing");
            current.status = RolloutPhase::Progressing;
            current.message = "Application resource became Progressing, \
                               updating status from Pending to Progressing."
                .into();
            current.last_transition_time = Some(now.to_string());
            current.step = step;
        }
    }

    if current.status == RolloutPhase::Waiting && is_application_healthy(obs)
    {
        info!(application = %name, "application already healthy");
        current.status = RolloutPhase::Healthy;
        current.message = "Application resource is already Healthy, \
                           updating status from Waiting to Healthy."
            .into();
        current.last_transition_time = Some(now.to_string());
        current.step = step;
    }

    if current.status == RolloutPhase::Progressing
        && is_application_healthy(obs)
    {
        info!(application = %name, "application became healthy");
        current.status = RolloutPhase::Healthy;
        current.message = "Application resource became Healthy, updating \
                           status from Progressing to Healthy."
            .into();
        current.last_transition_time = Some(now.to_string());
        current.step = step;
    }

    current
}
