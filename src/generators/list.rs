use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use serde_json::Value;

use super::{Generator, GeneratorErr, ParamMap};
use crate::crd::GeneratorSpec;
use crate::crd::app_set::{
    ApplicationSet, ApplicationSetTemplate, ListGeneratorSpec,
};

/// Fixed parameter lists spelled out directly in the ApplicationSet spec.
#[derive(Default)]
pub struct ListGenerator;

fn params_from_elements(
    spec: &ListGeneratorSpec,
) -> Result<Vec<ParamMap>, GeneratorErr> {
    spec.elements
        .iter()
        .map(|element| match element {
            Value::Object(map) => Ok(map.clone()),
            other => Err(GeneratorErr::InvalidElement(other.to_string())),
        })
        .collect()
}

#[async_trait]
impl Generator for ListGenerator {
    async fn generate_params(
        &self,
        entry: &GeneratorSpec,
        _appset: &ApplicationSet,
        _client: &Client,
    ) -> Result<Vec<ParamMap>, GeneratorErr> {
        let spec = entry.list.as_ref().ok_or(GeneratorErr::EmptySpec)?;
        params_from_elements(spec)
    }

    fn get_requeue_after(&self, _entry: &GeneratorSpec) -> Option<Duration> {
        None
    }

    fn get_template<'a>(
        &self,
        entry: &'a GeneratorSpec,
    ) -> Option<&'a ApplicationSetTemplate> {
        entry.list.as_ref().and_then(|l| l.template.as_ref())
    }
}
