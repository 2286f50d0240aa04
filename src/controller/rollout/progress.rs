use std::collections::HashMap;

use crate::controller::conditions::{
    REASON_APPLICATION_SET_MODIFIED, REASON_APPLICATION_SET_ROLLOUT_COMPLETE,
};
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetCondition, ApplicationSetConditionType,
    ConditionStatus, RolloutPhase,
};

/// The RolloutProgressing condition for the current rollout position:
/// walking steps in order, the first one with members that are not all
/// Healthy defines the step being rolled out. `None` when RollingSync is
/// not selected.
pub fn rollout_progress_condition(
    appset: &ApplicationSet,
) -> Option<ApplicationSetCondition> {
    let steps = appset.rolling_sync_steps()?;

    let mut completed: HashMap<i64, bool> = HashMap::new();
    if let Some(status) = appset.status.as_ref() {
        for entry in &status.application_status {
            let healthy = entry.status == RolloutPhase::Healthy;
            completed
                .entry(entry.step)
                .and_modify(|all| *all = *all && healthy)
                .or_insert(healthy);
        }
    }

    let mut progressing_step = None;
    for i in 1..=steps.len() as i64 {
        match completed.get(&i) {
            // a step with no members is already complete
            None => continue,
            Some(true) => continue,
            Some(false) => {
                progressing_step = Some(i);
                break;
            }
        }
    }

    Some(match progressing_step {
        Some(step) => ApplicationSetCondition {
            type_: ApplicationSetConditionType::RolloutProgressing,
            status: ConditionStatus::True,
            reason: REASON_APPLICATION_SET_MODIFIED.into(),
            message: format!(
                "ApplicationSet is performing rollout of step {step}"
            ),
            last_transition_time: None,
        },
        None => ApplicationSetCondition {
            type_: ApplicationSetConditionType::RolloutProgressing,
            status: ConditionStatus::False,
            reason: REASON_APPLICATION_SET_ROLLOUT_COMPLETE.into(),
            message: "ApplicationSet Rollout has completed".into(),
            last_transition_time: None,
        },
    })
}
