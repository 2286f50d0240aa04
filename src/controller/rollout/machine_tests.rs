#[cfg(test)]
mod tests {
    use crate::controller::rollout::machine::{
        AppObservation, is_application_healthy, next_application_status,
    };
    use crate::crd::app_set::{
        ApplicationSetApplicationStatus, RolloutPhase,
    };
    use crate::crd::application::{
        HealthStatusCode, OperationPhase, SyncStatusCode,
    };

    const NOW: &str = "2026-01-01T00:00:00+00:00";

    fn obs(
        health: HealthStatusCode,
        sync: SyncStatusCode,
        phase: Option<OperationPhase>,
    ) -> AppObservation {
        AppObservation {
            health,
            sync,
            operation_phase: phase,
            target_revisions: vec!["rev-1".into()],
        }
    }

    fn entry(
        status: RolloutPhase,
        revisions: &[&str],
    ) -> ApplicationSetApplicationStatus {
        ApplicationSetApplicationStatus {
            application: "a".into(),
            step: 1,
            status,
            message: String::new(),
            last_transition_time: Some("earlier".into()),
            target_revisions: Some(
                revisions.iter().map(|r| r.to_string()).collect(),
            ),
        }
    }

    #[test]
    fn healthy_definition() {
        assert!(is_application_healthy(&obs(
            HealthStatusCode::Healthy,
            SyncStatusCode::Synced,
            None
        )));
        assert!(is_application_healthy(&obs(
            HealthStatusCode::Healthy,
            SyncStatusCode::Synced,
            Some(OperationPhase::Succeeded)
        )));
        assert!(!is_application_healthy(&obs(
            HealthStatusCode::Healthy,
            SyncStatusCode::OutOfSync,
            None
        )));
        assert!(!is_application_healthy(&obs(
            HealthStatusCode::Progressing,
            SyncStatusCode::Synced,
            None
        )));
        assert!(!is_application_healthy(&obs(
            HealthStatusCode::Healthy,
            SyncStatusCode::Synced,
            Some(OperationPhase::Failed)
        )));
    }

    #[test]
    fn first_observation_defaults_to_waiting() {
        let next = next_application_status(
            "a",
            None,
            &obs(HealthStatusCode::Progressing, SyncStatusCode::Unknown, None),
            2,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Waiting);
        assert_eq!(next.step, 2);
        assert_eq!(next.target_revisions.as_deref(), Some(&["rev-1".into()][..]));
        assert!(next.message.contains("No Application status found"));
    }

    #[test]
    fn revision_change_resets_to_waiting() {
        let prev = entry(RolloutPhase::Healthy, &["rev-0"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(HealthStatusCode::Progressing, SyncStatusCode::Unknown, None),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Waiting);
        assert_eq!(next.target_revisions.as_deref(), Some(&["rev-1".into()][..]));
        assert!(next.message.contains("pending changes"));
        assert_eq!(next.last_transition_time.as_deref(), Some(NOW));
    }

    #[test]
    fn out_of_sync_resets_all_but_waiting_and_pending() {
        for (phase, resets) in [
            (RolloutPhase::Progressing, true),
            (RolloutPhase::Healthy, true),
            (RolloutPhase::Pending, false),
            (RolloutPhase::Waiting, false),
        ] {
            let prev = entry(phase, &["rev-1"]);
            let next = next_application_status(
                "a",
                Some(&prev),
                &obs(
                    HealthStatusCode::Unknown,
                    SyncStatusCode::OutOfSync,
                    None,
                ),
                1,
                true,
                NOW,
            );
            if resets {
                assert_eq!(next.status, RolloutPhase::Waiting, "{phase:?}");
            } else {
                assert_eq!(next.status, phase, "{phase:?}");
            }
        }
    }

    #[test]
    fn out_of_sync_is_ignored_without_progressive_sync() {
        let prev = entry(RolloutPhase::Healthy, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(HealthStatusCode::Unknown, SyncStatusCode::OutOfSync, None),
            1,
            false,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Healthy);
    }

    #[test]
    fn pending_progresses_after_successful_sync() {
        let prev = entry(RolloutPhase::Pending, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(
                HealthStatusCode::Unknown,
                SyncStatusCode::Synced,
                Some(OperationPhase::Succeeded),
            ),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Progressing);
        assert!(next.message.contains("completed a sync successfully"));
    }

    #[test]
    fn pending_progresses_when_operation_runs_or_health_progresses() {
        let prev = entry(RolloutPhase::Pending, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(
                HealthStatusCode::Unknown,
                SyncStatusCode::OutOfSync,
                Some(OperationPhase::Running),
            ),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Progressing);
        assert!(next.message.contains("became Progressing"));

        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(
                HealthStatusCode::Progressing,
                SyncStatusCode::OutOfSync,
                None,
            ),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Progressing);
    }

    #[test]
    fn waiting_jumps_straight_to_healthy() {
        let prev = entry(RolloutPhase::Waiting, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(HealthStatusCode::Healthy, SyncStatusCode::Synced, None),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Healthy);
        assert!(next.message.contains("already Healthy"));
    }

    #[test]
    fn progressing_becomes_healthy() {
        let prev = entry(RolloutPhase::Progressing, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(
                HealthStatusCode::Healthy,
                SyncStatusCode::Synced,
                Some(OperationPhase::Succeeded),
            ),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Healthy);
        assert!(next.message.contains("became Healthy"));
    }

    #[test]
    fn pending_sync_success_reaches_healthy_in_one_pass() {
        // Succeeded + already Healthy runtime state walks Pending →
        // Progressing → Healthy within a single evaluation.
        let prev = entry(RolloutPhase::Pending, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(
                HealthStatusCode::Healthy,
                SyncStatusCode::Synced,
                Some(OperationPhase::Succeeded),
            ),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Healthy);
    }

    #[test]
    fn no_transition_keeps_previous_record() {
        let prev = entry(RolloutPhase::Pending, &["rev-1"]);
        let next = next_application_status(
            "a",
            Some(&prev),
            &obs(HealthStatusCode::Unknown, SyncStatusCode::Synced, None),
            1,
            true,
            NOW,
        );
        assert_eq!(next.status, RolloutPhase::Pending);
        assert_eq!(next.last_transition_time.as_deref(), Some("earlier"));
    }
}
