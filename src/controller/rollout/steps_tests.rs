#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::controller::rollout::steps::{
        app_step, build_step_assignments,
    };
    use crate::crd::app_set::{
        ApplicationSet, ApplicationSetSpec, MatchExpression, RolloutStep,
        RolloutStrategy,
    };
    use crate::crd::application::Application;

    fn expr(key: &str, operator: &str, values: &[&str]) -> MatchExpression {
        MatchExpression {
            key: key.into(),
            operator: operator.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn appset_with_steps(steps: Vec<RolloutStep>) -> ApplicationSet {
        let mut appset =
            ApplicationSet::new("fleet", ApplicationSetSpec::default());
        appset.spec.strategy = Some(RolloutStrategy::RollingSync {
            steps,
            deletion_order: None,
        });
        appset
    }

    fn app(name: &str, labels: &[(&str, &str)]) -> Application {
        let mut app = Application::default();
        app.metadata.name = Some(name.into());
        app.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        app
    }

    #[test]
    fn in_operator_requires_key_and_value() {
        let appset = appset_with_steps(vec![RolloutStep {
            match_expressions: vec![expr("env", "In", &["dev", "qa"])],
            max_update: None,
        }]);
        let apps = vec![
            app("dev-app", &[("env", "dev")]),
            app("prod-app", &[("env", "prod")]),
            app("unlabeled", &[]),
        ];
        let (members, index) = build_step_assignments(&appset, &apps);
        assert_eq!(members[0], vec!["dev-app".to_string()]);
        assert_eq!(index.get("dev-app"), Some(&0));
        assert_eq!(app_step("prod-app", &index), -1);
        assert_eq!(app_step("unlabeled", &index), -1);
    }

    #[test]
    fn not_in_matches_absent_keys() {
        let appset = appset_with_steps(vec![RolloutStep {
            match_expressions: vec![expr("env", "NotIn", &["prod"])],
            max_update: None,
        }]);
        let apps = vec![
            app("dev-app", &[("env", "dev")]),
            app("prod-app", &[("env", "prod")]),
            app("unlabeled", &[]),
        ];
        let (members, _) = build_step_assignments(&appset, &apps);
        assert_eq!(
            members[0],
            vec!["dev-app".to_string(), "unlabeled".to_string()]
        );
    }

    #[test]
    fn invalid_operator_never_matches() {
        let appset = appset_with_steps(vec![RolloutStep {
            match_expressions: vec![expr("env", "Exists", &[])],
            max_update: None,
        }]);
        let apps =
            vec![app("dev-app", &[("env", "dev")]), app("unlabeled", &[])];
        let (members, index) = build_step_assignments(&appset, &apps);
        assert!(members[0].is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn expressions_within_a_step_are_anded() {
        let appset = appset_with_steps(vec![RolloutStep {
            match_expressions: vec![
                expr("env", "In", &["dev"]),
                expr("region", "In", &["eu"]),
            ],
            max_update: None,
        }]);
        let apps = vec![
            app("both", &[("env", "dev"), ("region", "eu")]),
            app("env-only", &[("env", "dev")]),
        ];
        let (members, _) = build_step_assignments(&appset, &apps);
        assert_eq!(members[0], vec!["both".to_string()]);
    }

    #[test]
    fn first_matching_step_wins_on_overlap() {
        let appset = appset_with_steps(vec![
            RolloutStep {
                match_expressions: vec![expr("env", "In", &["dev"])],
                max_update: None,
            },
            RolloutStep {
                match_expressions: vec![expr("env", "NotIn", &["prod"])],
                max_update: None,
            },
        ]);
        let apps = vec![app("dev-app", &[("env", "dev")])];
        let (members, index) = build_step_assignments(&appset, &apps);
        // the overlapping app is listed under both steps
        assert_eq!(members[0], vec!["dev-app".to_string()]);
        assert_eq!(members[1], vec!["dev-app".to_string()]);
        // but its authoritative assignment is the first match
        assert_eq!(index.get("dev-app"), Some(&0));
        assert_eq!(app_step("dev-app", &index), 1);
    }

    #[test]
    fn no_steps_without_rolling_sync_strategy() {
        let appset =
            ApplicationSet::new("fleet", ApplicationSetSpec::default());
        let apps = vec![app("a", &[])];
        let (members, index) = build_step_assignments(&appset, &apps);
        assert!(members.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn empty_expression_list_selects_everything() {
        let appset = appset_with_steps(vec![RolloutStep {
            match_expressions: vec![],
            max_update: None,
        }]);
        let apps = vec![app("a", &[]), app("b", &[("env", "dev")])];
        let (members, _) = build_step_assignments(&appset, &apps);
        assert_eq!(members[0].len(), 2);
    }
}
