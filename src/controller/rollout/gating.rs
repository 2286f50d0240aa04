use std::collections::HashMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{info, warn};

use super::machine::{AppObservation, is_application_healthy};
use super::steps::app_step;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetApplicationStatus, RolloutPhase,
};
use crate::crd::application::Application;

/// Which applications may sync this reconcile. Healthy steps and the
/// first unfinished step are enabled; everything after is held back.
pub fn build_app_sync_map(
    appset: &ApplicationSet,
    step_members: &[Vec<String>],
    app_map: &HashMap<String, Application>,
) -> HashMap<String, bool> {
    let mut sync_map = HashMap::new();
    let mut sync_enabled = true;

    for members in step_members {
        for name in members {
            sync_map.insert(name.clone(), sync_enabled);
        }

        for name in members {
            let Some(status) = appset.find_application_status(name) else {
                // no status yet, likely a freshly created member
                sync_enabled = false;
                break;
            };
            let Some(app) = app_map.get(name) else {
                // not among the managed applications, maybe deleting
                sync_enabled = false;
                break;
            };
            // the step must fully land before the next one may start
            let obs = AppObservation::from_app(app);
            sync_enabled = is_application_healthy(&obs)
                && status.status == RolloutPhase::Healthy;
            if !sync_enabled {
                break;
            }
        }
    }

    sync_map
}

/// Resolve a maxUpdate value against the step size. Percentages round
/// down, but any non-zero percentage admits at least one application.
fn resolve_max_update(
    max_update: &IntOrString,
    total: usize,
) -> Result<i64, String> {
    match max_update {
        IntOrString::Int(value) => Ok(*value as i64),
        IntOrString::String(raw) => {
            let percent = raw
                .strip_suffix('%')
                .ok_or_else(|| format!("invalid percentage: {raw}"))?
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("invalid percentage {raw}: {e}"))?;
            let scaled = percent * total as i64 / 100;
            if raw != "0%" && scaled < 1 {
                Ok(1)
            } else {
                Ok(scaled)
            }
        }
    }
}

/// Promote Waiting members of sync-enabled steps to Pending, without
/// letting any step exceed its maxUpdate cap of in-flight members.
pub fn promote_waiting_to_pending(
    appset: &ApplicationSet,
    statuses: &[ApplicationSetApplicationStatus],
    sync_map: &HashMap<String, bool>,
    step_index: &HashMap<String, usize>,
    now: &str,
) -> Vec<ApplicationSetApplicationStatus> {
    let Some(steps) = appset.rolling_sync_steps() else {
        return statuses.to_vec();
    };

    let mut in_flight = vec![0i64; steps.len()];
    let mut totals = vec![0i64; steps.len()];
    for status in statuses {
        let Some(&step) = step_index.get(&status.application) else {
            continue;
        };
        totals[step] += 1;
        if matches!(
            status.status,
            RolloutPhase::Pending | RolloutPhase::Progressing
        ) {
            in_flight[step] += 1;
        }
    }

    let mut out = Vec::with_capacity(statuses.len());
    for status in statuses {
        let mut status = status.clone();
        let step = step_index.get(&status.application).copied();

        let mut allowed = true;
        if let Some(step) = step {
            if let Some(max_update) = steps[step].max_update.as_ref() {
                match resolve_max_update(max_update, totals[step] as usize) {
                    Ok(cap) => {
                        if in_flight[step] >= cap {
                            allowed = false;
                            info!(
                                application = %status.application,
                                in_flight = in_flight[step],
                                cap,
                                step = step + 1,
                                "application is not allowed to update yet"
                            );
                        }
                    }
                    Err(reason) => warn!(
                        appset = %appset.name_any(),
                        %reason,
                        "invalid maxUpdate value, ignoring the cap for this step"
                    ),
                }
            }
        }

        if status.status == RolloutPhase::Waiting
            && sync_map.get(&status.application).copied().unwrap_or(false)
            && allowed
        {
            info!(
                application = %status.application,
                "application moved to Pending status"
            );
            status.status = RolloutPhase::Pending;
            status.message = "Application moved to Pending status, watching \
                              for the Application resource to start \
                              Progressing."
                .into();
            status.last_transition_time = Some(now.to_string());
            status.step = app_step(&status.application, step_index);
            if let Some(step) = step {
                in_flight[step] += 1;
            }
        }

        out.push(status);
    }
    out
}

#[cfg(test)]
mod resolve_tests {
    use super::*;

    #[test]
    fn integer_cap_is_used_directly() {
        assert_eq!(resolve_max_update(&IntOrString::Int(3), 10), Ok(3));
        assert_eq!(resolve_max_update(&IntOrString::Int(0), 10), Ok(0));
    }

    #[test]
    fn percentage_rounds_down() {
        assert_eq!(
            resolve_max_update(&IntOrString::String("50%".into()), 5),
            Ok(2)
        );
        assert_eq!(
            resolve_max_update(&IntOrString::String("100%".into()), 4),
            Ok(4)
        );
    }

    #[test]
    fn non_zero_percentage_admits_at_least_one() {
        assert_eq!(
            resolve_max_update(&IntOrString::String("10%".into()), 3),
            Ok(1)
        );
        assert_eq!(
            resolve_max_update(&IntOrString::String("0%".into()), 3),
            Ok(0)
        );
    }

    #[test]
    fn malformed_values_error() {
        assert!(
            resolve_max_update(&IntOrString::String("half".into()), 3)
                .is_err()
        );
        assert!(
            resolve_max_update(&IntOrString::String("x%".into()), 3).is_err()
        );
    }
}
