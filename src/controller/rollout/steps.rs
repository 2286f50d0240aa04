use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use kube::ResourceExt;
use tracing::warn;

use crate::crd::app_set::{ApplicationSet, MatchExpression};
use crate::crd::application::Application;

/// Bucket applications into rollout steps by label match expressions.
///
/// Returns the member names per step (an application can appear under
/// several steps when expressions overlap) and the authoritative
/// application-to-step assignment, where the first matching step wins.
pub fn build_step_assignments(
    appset: &ApplicationSet,
    applications: &[Application],
) -> (Vec<Vec<String>>, HashMap<String, usize>) {
    let Some(steps) = appset.rolling_sync_steps() else {
        return (Vec::new(), HashMap::new());
    };

    let mut step_members: Vec<Vec<String>> = vec![Vec::new(); steps.len()];
    let mut step_index: HashMap<String, usize> = HashMap::new();

    for app in applications {
        let name = app.name_any();
        let labels = app.labels_or_default();
        for (i, step) in steps.iter().enumerate() {
            let selected = step
                .match_expressions
                .iter()
                .all(|expr| expression_matches(expr, &labels));
            if !selected {
                continue;
            }
            step_members[i].push(name.clone());
            match step_index.entry(name.clone()) {
                Entry::Occupied(existing) => warn!(
                    appset = %appset.name_any(),
                    application = %name,
                    first_step = existing.get() + 1,
                    duplicate_step = i + 1,
                    "match expressions select the application twice; keeping the first step"
                ),
                Entry::Vacant(slot) => {
                    slot.insert(i);
                }
            }
        }
    }

    (step_members, step_index)
}

fn expression_matches(
    expr: &MatchExpression,
    labels: &BTreeMap<String, String>,
) -> bool {
    match expr.operator.as_str() {
        "In" => labels
            .get(&expr.key)
            .map(|value| expr.values.contains(value))
            .unwrap_or(false),
        "NotIn" => labels
            .get(&expr.key)
            .map(|value| !expr.values.contains(value))
            .unwrap_or(true),
        other => {
            warn!(
                operator = %other,
                "skipping rollout step application selection, invalid matchExpression operator"
            );
            false
        }
    }
}

/// 1-based step exposed in status; `-1` when no step selects the
/// application.
pub fn app_step(name: &str, step_index: &HashMap<String, usize>) -> i64 {
    step_index
        .get(name)
        .map(|&i| i as i64 + 1)
        .unwrap_or(-1)
}
