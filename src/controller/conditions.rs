use std::collections::BTreeSet;

use chrono::Utc;
use kube::ResourceExt;
use kube::api::Api;
use tracing::trace;

use super::retry::update_status_on_conflict;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetCondition, ApplicationSetConditionType,
    ConditionStatus,
};

pub const REASON_ERROR_OCCURRED: &str = "ErrorOccurred";
pub const REASON_PARAMETERS_GENERATED: &str = "ParametersGenerated";
pub const REASON_APPLICATION_SET_UP_TO_DATE: &str = "ApplicationSetUpToDate";
pub const REASON_APPLICATION_VALIDATION_ERROR: &str =
    "ApplicationValidationError";
pub const REASON_APPLICATION_GENERATION_FROM_PARAMS_ERROR: &str =
    "ApplicationGenerationFromParamsError";
pub const REASON_RENDER_TEMPLATE_PARAMS_ERROR: &str =
    "RenderTemplateParamsError";
pub const REASON_CREATE_APPLICATION_ERROR: &str = "CreateApplicationError";
pub const REASON_UPDATE_APPLICATION_ERROR: &str = "UpdateApplicationError";
pub const REASON_DELETE_APPLICATION_ERROR: &str = "DeleteApplicationError";
pub const REASON_REFRESH_APPLICATION_ERROR: &str = "RefreshApplicationError";
pub const REASON_APPLICATION_SET_MODIFIED: &str = "ApplicationSetModified";
pub const REASON_APPLICATION_SET_ROLLOUT_COMPLETE: &str =
    "ApplicationSetRolloutComplete";

pub fn error_condition(
    reason: &str,
    message: String,
) -> ApplicationSetCondition {
    ApplicationSetCondition {
        type_: ApplicationSetConditionType::ErrorOccurred,
        status: ConditionStatus::True,
        reason: reason.to_string(),
        message,
        last_transition_time: None,
    }
}

fn parameters_generated_condition(
    parameters_generated: bool,
    message: &str,
) -> ApplicationSetCondition {
    if parameters_generated {
        ApplicationSetCondition {
            type_: ApplicationSetConditionType::ParametersGenerated,
            status: ConditionStatus::True,
            reason: REASON_PARAMETERS_GENERATED.into(),
            message: "Successfully generated parameters for all Applications"
                .into(),
            last_transition_time: None,
        }
    } else {
        ApplicationSetCondition {
            type_: ApplicationSetConditionType::ParametersGenerated,
            status: ConditionStatus::False,
            reason: REASON_ERROR_OCCURRED.into(),
            message: message.to_string(),
            last_transition_time: None,
        }
    }
}

/// Expand one incoming condition into the full set of conditions it
/// implies, plus the set of condition types this evaluation is
/// authoritative for. Cross-invariants:
/// `ResourcesUpToDate=True` forces `ErrorOccurred=False`;
/// `ErrorOccurred=True` forces `ResourcesUpToDate=False`;
/// `ParametersGenerated` is always present; `RolloutProgressing` is only
/// kept while the RollingSync strategy is selected.
pub fn evaluate_condition(
    appset: &ApplicationSet,
    condition: ApplicationSetCondition,
    parameters_generated: bool,
) -> (
    Vec<ApplicationSetCondition>,
    BTreeSet<ApplicationSetConditionType>,
) {
    let mut evaluated = BTreeSet::from([
        ApplicationSetConditionType::ParametersGenerated,
        condition.type_,
    ]);
    if !appset.is_rolling_sync() {
        // evaluating it with no replacement removes any stale entry
        evaluated.insert(ApplicationSetConditionType::RolloutProgressing);
    }

    let mut new_conditions = vec![condition.clone()];
    if condition.type_ != ApplicationSetConditionType::ParametersGenerated {
        new_conditions.push(parameters_generated_condition(
            parameters_generated,
            &condition.message,
        ));
    }

    match condition.type_ {
        ApplicationSetConditionType::ResourcesUpToDate
            if condition.status == ConditionStatus::True =>
        {
            evaluated.insert(ApplicationSetConditionType::ErrorOccurred);
            new_conditions.push(ApplicationSetCondition {
                type_: ApplicationSetConditionType::ErrorOccurred,
                status: ConditionStatus::False,
                reason: condition.reason.clone(),
                message: condition.message.clone(),
                last_transition_time: None,
            });
        }
        ApplicationSetConditionType::ErrorOccurred
            if condition.status == ConditionStatus::True =>
        {
            evaluated.insert(ApplicationSetConditionType::ResourcesUpToDate);
            new_conditions.push(ApplicationSetCondition {
                type_: ApplicationSetConditionType::ResourcesUpToDate,
                status: ConditionStatus::False,
                reason: REASON_ERROR_OCCURRED.into(),
                message: condition.message.clone(),
                last_transition_time: None,
            });
        }
        ApplicationSetConditionType::RolloutProgressing
            if !appset.is_rolling_sync() =>
        {
            evaluated.remove(&ApplicationSetConditionType::RolloutProgressing);
        }
        _ => {}
    }

    (new_conditions, evaluated)
}

/// Merge incoming conditions into the current set. Conditions of
/// evaluated types are replaced (keeping the previous record, and with it
/// the transition time, when reason/status/message are unchanged);
/// conditions of unevaluated types pass through untouched.
pub fn merge_conditions(
    current: &[ApplicationSetCondition],
    incoming: Vec<ApplicationSetCondition>,
    evaluated: &BTreeSet<ApplicationSetConditionType>,
    now: &str,
) -> Vec<ApplicationSetCondition> {
    let mut out: Vec<ApplicationSetCondition> = Vec::new();
    for mut condition in incoming {
        if condition.last_transition_time.is_none() {
            condition.last_transition_time = Some(now.to_string());
        }
        match current.iter().find(|c| c.type_ == condition.type_) {
            Some(existing)
                if existing.message == condition.message
                    && existing.reason == condition.reason
                    && existing.status == condition.status =>
            {
                out.push(existing.clone());
            }
            _ => out.push(condition),
        }
    }
    out.sort_by_key(|c| c.type_);
    for condition in current {
        if !evaluated.contains(&condition.type_) {
            out.push(condition.clone());
        }
    }
    out
}

/// Equality over `{type, reason, status, message}` in order; transition
/// times are bookkeeping and do not force a write.
pub fn conditions_equivalent(
    a: &[ApplicationSetCondition],
    b: &[ApplicationSetCondition],
) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.type_ == y.type_
                && x.reason == y.reason
                && x.status == y.status
                && x.message == y.message
        })
}

/// Apply one condition (and everything it implies) to the parent status,
/// skipping the store write when nothing material changed.
pub async fn set_status_condition(
    api: &Api<ApplicationSet>,
    appset: &mut ApplicationSet,
    condition: ApplicationSetCondition,
    parameters_generated: bool,
) -> Result<(), kube::Error> {
    let name = appset.name_any();
    let now = Utc::now().to_rfc3339();
    let (incoming, evaluated) =
        evaluate_condition(appset, condition, parameters_generated);

    let previous = appset
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let merged =
        merge_conditions(&previous, incoming.clone(), &evaluated, &now);
    if conditions_equivalent(&previous, &merged) {
        trace!(%name, "conditions unchanged; skipping status write");
        return Ok(());
    }

    let updated = update_status_on_conflict(api, &name, |latest| {
        let current = latest
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        let merged =
            merge_conditions(&current, incoming.clone(), &evaluated, &now);
        latest
            .status
            .get_or_insert_with(Default::default)
            .conditions = merged;
    })
    .await?;
    if let Some(updated) = updated {
        *appset = updated;
    } else {
        // parent vanished mid-write; nothing left to record
        appset
            .status
            .get_or_insert_with(Default::default)
            .conditions = merged;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::app_set::{
        ApplicationSetSpec, RolloutStep, RolloutStrategy,
    };

    fn appset(rolling: bool) -> ApplicationSet {
        let mut appset =
            ApplicationSet::new("fleet", ApplicationSetSpec::default());
        if rolling {
            appset.spec.strategy = Some(RolloutStrategy::RollingSync {
                steps: vec![RolloutStep::default()],
                deletion_order: None,
            });
        }
        appset
    }

    fn up_to_date() -> ApplicationSetCondition {
        ApplicationSetCondition {
            type_: ApplicationSetConditionType::ResourcesUpToDate,
            status: ConditionStatus::True,
            reason: REASON_APPLICATION_SET_UP_TO_DATE.into(),
            message: "All applications have been generated successfully"
                .into(),
            last_transition_time: None,
        }
    }

    fn find(
        conditions: &[ApplicationSetCondition],
        type_: ApplicationSetConditionType,
    ) -> Option<&ApplicationSetCondition> {
        conditions.iter().find(|c| c.type_ == type_)
    }

    #[test]
    fn resources_up_to_date_implies_no_error() {
        let (incoming, evaluated) =
            evaluate_condition(&appset(false), up_to_date(), true);
        let merged = merge_conditions(&[], incoming, &evaluated, "t0");

        let err = find(
            &merged,
            ApplicationSetConditionType::ErrorOccurred,
        )
        .expect("paired ErrorOccurred");
        assert_eq!(err.status, ConditionStatus::False);
        let params = find(
            &merged,
            ApplicationSetConditionType::ParametersGenerated,
        )
        .expect("ParametersGenerated always present");
        assert_eq!(params.status, ConditionStatus::True);
    }

    #[test]
    fn error_implies_resources_not_up_to_date() {
        let condition = error_condition(
            REASON_APPLICATION_VALIDATION_ERROR,
            "duplicate name".into(),
        );
        let (incoming, evaluated) =
            evaluate_condition(&appset(false), condition, true);
        let merged = merge_conditions(&[], incoming, &evaluated, "t0");

        let utd = find(
            &merged,
            ApplicationSetConditionType::ResourcesUpToDate,
        )
        .expect("paired ResourcesUpToDate");
        assert_eq!(utd.status, ConditionStatus::False);
        assert_eq!(utd.reason, REASON_ERROR_OCCURRED);
    }

    #[test]
    fn rollout_progressing_removed_when_strategy_is_off() {
        let existing = vec![ApplicationSetCondition {
            type_: ApplicationSetConditionType::RolloutProgressing,
            status: ConditionStatus::True,
            reason: REASON_APPLICATION_SET_MODIFIED.into(),
            message: "rollout of step 1".into(),
            last_transition_time: Some("t0".into()),
        }];
        let (incoming, evaluated) =
            evaluate_condition(&appset(false), up_to_date(), true);
        let merged = merge_conditions(&existing, incoming, &evaluated, "t1");
        assert!(
            find(&merged, ApplicationSetConditionType::RolloutProgressing)
                .is_none()
        );

        // with RollingSync selected the entry is left alone
        let (incoming, evaluated) =
            evaluate_condition(&appset(true), up_to_date(), true);
        let merged = merge_conditions(&existing, incoming, &evaluated, "t1");
        assert!(
            find(&merged, ApplicationSetConditionType::RolloutProgressing)
                .is_some()
        );
    }

    #[test]
    fn unchanged_conditions_keep_their_transition_time() {
        let (incoming, evaluated) =
            evaluate_condition(&appset(false), up_to_date(), true);
        let first =
            merge_conditions(&[], incoming.clone(), &evaluated, "t0");
        let second = merge_conditions(&first, incoming, &evaluated, "t1");
        assert!(conditions_equivalent(&first, &second));
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.last_transition_time, b.last_transition_time);
        }
    }
}
