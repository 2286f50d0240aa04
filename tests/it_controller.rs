// Integration tests require a running Kubernetes cluster with the
// ApplicationSet, Application and AppProject CRDs applied. They are
// ignored by default.

use std::time::Duration;

use envconfig::Envconfig;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use appset_controller::config::ControllerConfig;
use appset_controller::controller::run_controller;
use appset_controller::crd::app_set::{
    ApplicationSet, ApplicationSetConditionType, ApplicationSetSpec,
    ApplicationSetTemplate, ApplicationSetTemplateMeta, ConditionStatus,
    GeneratorSpec, ListGeneratorSpec,
};
use appset_controller::crd::application::{
    Application, ApplicationDestination, ApplicationSpec,
};

mod common;
use common::{
    ControllerGuard, cleanup, ensure_project, set_env, uniq,
    wait_for_applications,
};

fn list_appset(name: &str, elements: Vec<serde_json::Value>) -> ApplicationSet {
    ApplicationSet::new(
        name,
        ApplicationSetSpec {
            generators: vec![GeneratorSpec {
                list: Some(ListGeneratorSpec {
                    elements,
                    template: None,
                }),
                clusters: None,
            }],
            template: ApplicationSetTemplate {
                metadata: ApplicationSetTemplateMeta {
                    name: format!("{name}-{{{{appName}}}}"),
                    ..Default::default()
                },
                spec: ApplicationSpec {
                    project: "default".into(),
                    source: None,
                    destination: ApplicationDestination {
                        server: Some(
                            "https://kubernetes.default.svc".into(),
                        ),
                        name: None,
                        namespace: Some("default".into()),
                    },
                    sync_policy: None,
                },
            },
            ..Default::default()
        },
    )
}

#[test_log::test(tokio::test)]
#[ignore]
async fn controller_creates_applications_from_list_generator() {
    let _g1 = set_env("APPSET_CONTROL_NAMESPACE", "default");
    let _g2 = set_env("APPSET_POLICY", "sync");
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    ensure_project(client.clone(), ns, "default").await;

    let name = uniq("appset-it-create");
    let guard = ControllerGuard::new(ns, &name, client.clone());
    let api: Api<ApplicationSet> = Api::namespaced(client.clone(), ns);
    let appset = list_appset(
        &name,
        vec![json!({"appName": "a"}), json!({"appName": "b"})],
    );
    api.create(&PostParams::default(), &appset)
        .await
        .expect("create appset");

    let cfg = ControllerConfig::init_from_env().expect("config");
    let ctrl_client = client.clone();
    let ctrl = tokio::spawn(async move {
        let _ = run_controller(ctrl_client, cfg).await;
    });
    let _guard = guard.with_controller(ctrl);

    let a = format!("{name}-a");
    let b = format!("{name}-b");
    assert!(
        wait_for_applications(client.clone(), ns, &[&a, &b], 30).await,
        "expected generated applications {a} and {b}"
    );

    // children carry a controller owner reference at the parent
    let apps: Api<Application> = Api::namespaced(client.clone(), ns);
    let child = apps.get(&a).await.expect("get generated application");
    assert!(child.owner_references().iter().any(|or| {
        or.controller == Some(true)
            && or.kind == "ApplicationSet"
            && or.name == name
    }));

    // parent settles with ResourcesUpToDate=True
    let mut up_to_date = false;
    for _ in 0..30 {
        let parent = api.get(&name).await.expect("get appset");
        up_to_date = parent
            .status
            .as_ref()
            .map(|s| {
                s.conditions.iter().any(|c| {
                    c.type_ == ApplicationSetConditionType::ResourcesUpToDate
                        && c.status == ConditionStatus::True
                })
            })
            .unwrap_or(false);
        if up_to_date {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    assert!(up_to_date, "expected ResourcesUpToDate=True");

    drop(_guard);
    cleanup(ns, &name, client).await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn controller_prunes_applications_dropped_from_the_desired_set() {
    let _g1 = set_env("APPSET_CONTROL_NAMESPACE", "default");
    let _g2 = set_env("APPSET_POLICY", "sync");
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    ensure_project(client.clone(), ns, "default").await;

    let name = uniq("appset-it-prune");
    let guard = ControllerGuard::new(ns, &name, client.clone());
    let api: Api<ApplicationSet> = Api::namespaced(client.clone(), ns);
    let appset = list_appset(
        &name,
        vec![json!({"appName": "a"}), json!({"appName": "b"})],
    );
    api.create(&PostParams::default(), &appset)
        .await
        .expect("create appset");

    let cfg = ControllerConfig::init_from_env().expect("config");
    let ctrl_client = client.clone();
    let ctrl = tokio::spawn(async move {
        let _ = run_controller(ctrl_client, cfg).await;
    });
    let _guard = guard.with_controller(ctrl);

    let a = format!("{name}-a");
    let b = format!("{name}-b");
    assert!(
        wait_for_applications(client.clone(), ns, &[&a, &b], 30).await
    );

    // shrink the desired set to just "a"
    let patch = json!({"spec": {"generators": [
        {"list": {"elements": [{"appName": "a"}]}}
    ]}});
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("shrink appset");

    let apps: Api<Application> = Api::namespaced(client.clone(), ns);
    let mut pruned = false;
    for _ in 0..30 {
        let gone = apps.get_opt(&b).await.expect("get_opt").is_none();
        let kept = apps.get_opt(&a).await.expect("get_opt").is_some();
        if gone && kept {
            pruned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    assert!(pruned, "expected {b} pruned and {a} kept");

    drop(_guard);
    cleanup(ns, &name, client).await;
}

#[test_log::test(tokio::test)]
#[ignore]
async fn controller_deletion_removes_children_and_finalizer() {
    let _g1 = set_env("APPSET_CONTROL_NAMESPACE", "default");
    let _g2 = set_env("APPSET_POLICY", "sync");
    let client = Client::try_default().await.expect("kube client");
    let ns = "default";
    ensure_project(client.clone(), ns, "default").await;

    let name = uniq("appset-it-del");
    let guard = ControllerGuard::new(ns, &name, client.clone());
    let api: Api<ApplicationSet> = Api::namespaced(client.clone(), ns);
    let appset = list_appset(&name, vec![json!({"appName": "a"})]);
    api.create(&PostParams::default(), &appset)
        .await
        .expect("create appset");

    let cfg = ControllerConfig::init_from_env().expect("config");
    let ctrl_client = client.clone();
    let ctrl = tokio::spawn(async move {
        let _ = run_controller(ctrl_client, cfg).await;
    });
    let _guard = guard.with_controller(ctrl);

    let a = format!("{name}-a");
    assert!(wait_for_applications(client.clone(), ns, &[&a], 30).await);

    // the controller added its finalizer, so deletion runs teardown
    let parent = api.get(&name).await.expect("get appset");
    assert!(parent.finalizers().iter().any(|f| f.contains("finalizer")));

    let _ = api.delete(&name, &Default::default()).await;

    let mut gone = false;
    for _ in 0..60 {
        if api.get_opt(&name).await.expect("get_opt").is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    assert!(gone, "appset should be fully removed after teardown");

    drop(_guard);
    cleanup(ns, &name, client).await;
}
