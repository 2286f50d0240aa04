mod cluster;
mod list;

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;

use crate::crd::app_set::{ApplicationSet, ApplicationSetTemplate};
use crate::crd::GeneratorSpec;

pub use cluster::ClusterGenerator;
pub use list::ListGenerator;

/// Parameters produced for one member application.
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

#[derive(thiserror::Error, Debug)]
pub enum GeneratorErr {
    #[error("generator spec fragment is empty")]
    EmptySpec,
    #[error("list generator element must be an object, got: {0}")]
    InvalidElement(String),
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

/// A parameter producer. Implementations read external state but never
/// mutate it.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate_params(
        &self,
        entry: &GeneratorSpec,
        appset: &ApplicationSet,
        client: &Client,
    ) -> Result<Vec<ParamMap>, GeneratorErr>;

    /// Periodic refresh this generator wants beyond event triggers.
    fn get_requeue_after(&self, entry: &GeneratorSpec) -> Option<Duration>;

    /// Per-generator template override, when the spec fragment carries one.
    fn get_template<'a>(
        &self,
        entry: &'a GeneratorSpec,
    ) -> Option<&'a ApplicationSetTemplate>;
}

/// Closed set of known generators, dispatched on which fragment of the
/// generator spec is populated.
pub struct GeneratorRegistry {
    list: ListGenerator,
    clusters: ClusterGenerator,
}

impl GeneratorRegistry {
    pub fn new(control_namespace: String) -> Self {
        Self {
            list: ListGenerator,
            clusters: ClusterGenerator::new(control_namespace),
        }
    }

    /// The generators addressed by one spec entry. Normally one; an entry
    /// with several fragments set activates each of them.
    pub fn relevant(&self, spec: &GeneratorSpec) -> Vec<&dyn Generator> {
        let mut found: Vec<&dyn Generator> = Vec::new();
        if spec.list.is_some() {
            found.push(&self.list);
        }
        if spec.clusters.is_some() {
            found.push(&self.clusters);
        }
        found
    }

    /// Smallest requeue requested by any generator on the ApplicationSet;
    /// `None` means event triggers alone suffice.
    pub fn min_requeue_after(
        &self,
        appset: &ApplicationSet,
    ) -> Option<Duration> {
        min_non_zero(appset.spec.generators.iter().flat_map(|g| {
            self.relevant(g)
                .into_iter()
                .map(|generator| generator.get_requeue_after(g))
        }))
    }
}

fn min_non_zero(
    durations: impl IntoIterator<Item = Option<Duration>>,
) -> Option<Duration> {
    durations
        .into_iter()
        .flatten()
        .filter(|d| !d.is_zero())
        .min()
}
