use std::collections::HashMap;

use kube::ResourceExt;
use tracing::info;

use crate::crd::app_set::{ApplicationSet, RolloutPhase};
use crate::crd::application::{
    Application, Operation, OperationInfo, OperationInitiator, RetryStrategy,
    SyncOperation, SyncStatusCode,
};

const SYNC_INITIATOR: &str = "applicationset-controller";
const SYNC_REASON: &str =
    "ApplicationSet RollingSync triggered a sync of this Application resource";
const DEFAULT_SYNC_RETRY_LIMIT: i64 = 5;

/// Overlay one-shot sync operations on the members the rollout allows to
/// sync right now. RollingSync members also get their automated sync
/// policy unset, since this controller drives their syncs from here on.
pub fn overlay_sync_operations(
    appset: &ApplicationSet,
    sync_map: &HashMap<String, bool>,
    app_map: &HashMap<String, Application>,
    valid_apps: Vec<Application>,
) -> Vec<Application> {
    let mut out = Vec::with_capacity(valid_apps.len());
    for mut app in valid_apps {
        let name = app.name_any();

        let mut prune_enabled = false;
        if let Some(policy) = app.spec.sync_policy.as_mut() {
            if let Some(automated) = policy.automated.take() {
                prune_enabled = automated.prune;
            }
        }

        let pending = appset
            .find_application_status(&name)
            .map(|s| s.status == RolloutPhase::Pending)
            .unwrap_or(false);
        let out_of_sync = app_map
            .get(&name)
            .map(|live| live.sync_status() == SyncStatusCode::OutOfSync)
            .unwrap_or(false);

        if pending
            && out_of_sync
            && sync_map.get(&name).copied().unwrap_or(false)
        {
            info!(application = %name, prune_enabled, "triggering sync");
            app = with_sync_operation(app, prune_enabled);
        }
        out.push(app);
    }
    out
}

/// Attach the sync operation that makes the application controller run a
/// sync on behalf of the rollout.
fn with_sync_operation(mut app: Application, prune: bool) -> Application {
    let mut operation = Operation {
        initiated_by: OperationInitiator {
            username: SYNC_INITIATOR.into(),
            automated: true,
        },
        info: vec![OperationInfo {
            name: "Reason".into(),
            value: SYNC_REASON.into(),
        }],
        sync: Some(SyncOperation {
            prune: false,
            sync_options: None,
        }),
        // matches the application controller's own auto-sync retry budget
        retry: RetryStrategy {
            limit: DEFAULT_SYNC_RETRY_LIMIT,
        },
    };

    if let Some(policy) = app.spec.sync_policy.as_ref() {
        if let Some(retry) = policy.retry.as_ref() {
            operation.retry = retry.clone();
        }
        let sync = operation.sync.get_or_insert_with(Default::default);
        sync.sync_options = policy.sync_options.clone();
        sync.prune = prune;
    }

    app.operation = Some(operation);
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::application::{AutomatedSyncPolicy, SyncPolicy};

    #[test]
    fn sync_operation_forwards_prune_and_options() {
        let mut app = Application::default();
        app.spec.sync_policy = Some(SyncPolicy {
            automated: None,
            sync_options: Some(vec!["CreateNamespace=true".into()]),
            retry: Some(RetryStrategy { limit: 7 }),
        });
        let app = with_sync_operation(app, true);
        let op = app.operation.unwrap();
        assert_eq!(op.initiated_by.username, SYNC_INITIATOR);
        assert!(op.initiated_by.automated);
        assert_eq!(op.retry.limit, 7);
        let sync = op.sync.unwrap();
        assert!(sync.prune);
        assert_eq!(
            sync.sync_options.unwrap(),
            vec!["CreateNamespace=true".to_string()]
        );
    }

    #[test]
    fn sync_operation_defaults_without_policy() {
        let app = with_sync_operation(Application::default(), true);
        let op = app.operation.unwrap();
        assert_eq!(op.retry.limit, DEFAULT_SYNC_RETRY_LIMIT);
        // prune only forwards when the application carries a sync policy
        assert!(!op.sync.unwrap().prune);
    }

    #[test]
    fn automated_policy_is_unset_on_every_rolling_sync_member() {
        use crate::crd::app_set::ApplicationSetSpec;

        let appset =
            ApplicationSet::new("fleet", ApplicationSetSpec::default());
        let mut app = Application::default();
        app.metadata.name = Some("a".into());
        app.spec.sync_policy = Some(SyncPolicy {
            automated: Some(AutomatedSyncPolicy {
                prune: true,
                self_heal: false,
            }),
            sync_options: None,
            retry: None,
        });

        let out = overlay_sync_operations(
            &appset,
            &HashMap::new(),
            &HashMap::new(),
            vec![app],
        );
        assert!(out[0].spec.sync_policy.as_ref().unwrap().automated.is_none());
        // not pending, so no operation was attached
        assert!(out[0].operation.is_none());
    }
}
