use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::{Api, ListParams};
use serde_json::Value;

use super::{Generator, GeneratorErr, ParamMap};
use crate::crd::GeneratorSpec;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetTemplate, ClusterGeneratorSpec,
};
use crate::resolver::CLUSTER_SECRET_SELECTOR;
use kube::ResourceExt;

/// Parameterizes over the registered destination clusters. Cluster
/// registrations live as labeled secrets in the control namespace, so
/// changes arrive as secret watch events rather than through a periodic
/// requeue.
#[derive(Default)]
pub struct ClusterGenerator {
    control_namespace: String,
}

impl ClusterGenerator {
    pub fn new(control_namespace: String) -> Self {
        Self { control_namespace }
    }
}

fn secret_selector(spec: &ClusterGeneratorSpec) -> String {
    let mut selector = CLUSTER_SECRET_SELECTOR.to_string();
    if let Some(labels) = spec.match_labels.as_ref() {
        for (key, value) in labels {
            selector.push_str(&format!(",{key}={value}"));
        }
    }
    selector
}

fn params_from_secret(secret: &Secret) -> Option<ParamMap> {
    let data = secret.data.as_ref()?;
    let field = |key: &str| {
        data.get(key)
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
    };
    let name = field("name")?;
    let server = field("server")?;

    let mut params = ParamMap::new();
    params.insert("name".into(), Value::String(name));
    params.insert("server".into(), Value::String(server));
    let labels: serde_json::Map<String, Value> = secret
        .labels()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    params.insert(
        "metadata".into(),
        serde_json::json!({ "labels": Value::Object(labels) }),
    );
    Some(params)
}

#[async_trait]
impl Generator for ClusterGenerator {
    async fn generate_params(
        &self,
        entry: &GeneratorSpec,
        _appset: &ApplicationSet,
        client: &Client,
    ) -> Result<Vec<ParamMap>, GeneratorErr> {
        let spec = entry.clusters.as_ref().ok_or(GeneratorErr::EmptySpec)?;
        let secrets: Api<Secret> =
            Api::namespaced(client.clone(), &self.control_namespace);
        let lp = ListParams::default().labels(&secret_selector(spec));
        let list = secrets.list(&lp).await?;
        Ok(list.items.iter().filter_map(params_from_secret).collect())
    }

    fn get_requeue_after(&self, _entry: &GeneratorSpec) -> Option<Duration> {
        None
    }

    fn get_template<'a>(
        &self,
        entry: &'a GeneratorSpec,
    ) -> Option<&'a ApplicationSetTemplate> {
        entry.clusters.as_ref().and_then(|c| c.template.as_ref())
    }
}
