pub mod conditions;
pub mod deletion;
pub mod events;
pub mod materializer;
pub mod predicates;
pub mod reconcile;
pub mod retry;
pub mod rollout;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::runtime::{Controller, controller::Action};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::crd::{Application, ApplicationSet};
use crate::generators::GeneratorRegistry;
use crate::resolver::CLUSTER_SECRET_SELECTOR;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("reverse deletion stalled: {0}")]
    Orchestration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub struct ControllerContext {
    pub client: Client,
    pub cfg: ControllerConfig,
    pub generators: GeneratorRegistry,
    pub recorder: Recorder,
}

fn scoped_api<K>(client: Client, namespaces: &[String]) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    match namespaces {
        [single] if single.as_str() != "*" => {
            Api::namespaced(client, single)
        }
        _ => Api::all(client),
    }
}

/// Wire the watch streams and run the reconciler until the process exits.
pub async fn run_controller(
    client: Client,
    cfg: ControllerConfig,
) -> anyhow::Result<()> {
    let namespaces = cfg.allowed_namespaces();
    let progressive = cfg.enable_progressive_syncs;
    let control_namespace = cfg.control_namespace.clone();
    info!(?namespaces, progressive, "starting applicationset controller");

    let appsets: Api<ApplicationSet> =
        scoped_api(client.clone(), &namespaces);
    let apps: Api<Application> = scoped_api(client.clone(), &namespaces);
    let cluster_secrets: Api<Secret> =
        Api::namespaced(client.clone(), &cfg.control_namespace);

    let (reader, appset_stream) = predicates::application_set_trigger_stream(
        appsets,
        Config::default().any_semantic(),
        namespaces.clone(),
        progressive,
    );
    let app_stream = predicates::application_trigger_stream(
        apps,
        Config::default().any_semantic(),
        namespaces.clone(),
        progressive,
    );

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "appset-controller".into(),
            instance: None,
        },
    );
    let ctx = Arc::new(ControllerContext {
        client,
        cfg,
        // cluster params come from the same secrets the resolver reads
        generators: GeneratorRegistry::new(control_namespace),
        recorder,
    });

    // a cluster registration change re-parameterizes every ApplicationSet
    // that uses the cluster generator
    let secret_mapper = {
        let store = reader.clone();
        move |_secret: Secret| {
            store
                .state()
                .into_iter()
                .filter(|appset| {
                    appset
                        .spec
                        .generators
                        .iter()
                        .any(|g| g.clusters.is_some())
                })
                .map(|appset| ObjectRef::from_obj(&*appset))
                .collect::<Vec<_>>()
        }
    };

    Controller::for_stream(appset_stream, reader)
        .owns_stream(app_stream)
        .watches(
            cluster_secrets,
            Config::default().labels(CLUSTER_SECRET_SELECTOR),
            secret_mapper,
        )
        .run(reconcile::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj_ref, action)) => {
                    info!(appset = %obj_ref.name, ?action, "reconciled")
                }
                Err(err) => error!(error = ?err, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    _appset: Arc<ApplicationSet>,
    error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    error!(%error, "reconcile failed, backing off");
    Action::requeue(Duration::from_secs(60))
}
