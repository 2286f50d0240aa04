use std::str::FromStr;

use envconfig::Envconfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    /// Comma-separated namespaces served by this controller. Empty means
    /// every namespace.
    /// Env: APPSET_NAMESPACES
    #[envconfig(from = "APPSET_NAMESPACES", default = "")]
    pub namespaces: String,

    /// Namespace holding AppProjects and cluster secrets.
    /// Env: APPSET_CONTROL_NAMESPACE
    #[envconfig(from = "APPSET_CONTROL_NAMESPACE", default = "argocd")]
    pub control_namespace: String,

    /// Controller-level application sync policy.
    /// Env: APPSET_POLICY (create-only | create-update | create-delete | sync)
    #[envconfig(from = "APPSET_POLICY", default = "sync")]
    pub policy: ApplicationsSyncPolicy,

    /// Allow per-ApplicationSet `spec.syncPolicy.applicationsSync` to
    /// override the controller-level policy.
    /// Env: APPSET_ENABLE_POLICY_OVERRIDE
    #[envconfig(from = "APPSET_ENABLE_POLICY_OVERRIDE", default = "false")]
    pub enable_policy_override: bool,

    /// Enable the RollingSync progressive rollout machinery.
    /// Env: APPSET_ENABLE_PROGRESSIVE_SYNCS
    #[envconfig(from = "APPSET_ENABLE_PROGRESSIVE_SYNCS", default = "false")]
    pub enable_progressive_syncs: bool,

    /// Comma-separated annotation keys preserved on generated applications
    /// in addition to the per-ApplicationSet and built-in lists.
    /// Env: APPSET_GLOBAL_PRESERVED_ANNOTATIONS
    #[envconfig(from = "APPSET_GLOBAL_PRESERVED_ANNOTATIONS", default = "")]
    pub global_preserved_annotations: String,

    /// Same for label keys.
    /// Env: APPSET_GLOBAL_PRESERVED_LABELS
    #[envconfig(from = "APPSET_GLOBAL_PRESERVED_LABELS", default = "")]
    pub global_preserved_labels: String,
}

impl ControllerConfig {
    pub fn allowed_namespaces(&self) -> Vec<String> {
        split_csv(&self.namespaces)
    }

    pub fn global_preserved_annotation_keys(&self) -> Vec<String> {
        split_csv(&self.global_preserved_annotations)
    }

    pub fn global_preserved_label_keys(&self) -> Vec<String> {
        split_csv(&self.global_preserved_labels)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// What the controller is allowed to do to member applications. Creation
/// is always permitted; the variants differ on update and delete.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    PartialEq,
    Eq,
)]
pub enum ApplicationsSyncPolicy {
    #[serde(rename = "create-only")]
    CreateOnly,
    #[serde(rename = "create-update")]
    CreateUpdate,
    #[serde(rename = "create-delete")]
    CreateDelete,
    #[serde(rename = "sync")]
    Sync,
}

impl ApplicationsSyncPolicy {
    pub fn allow_update(self) -> bool {
        matches!(self, Self::CreateUpdate | Self::Sync)
    }

    pub fn allow_delete(self) -> bool {
        matches!(self, Self::CreateDelete | Self::Sync)
    }
}

impl FromStr for ApplicationsSyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "create-only" => Ok(Self::CreateOnly),
            "create-update" => Ok(Self::CreateUpdate),
            "create-delete" => Ok(Self::CreateDelete),
            "sync" => Ok(Self::Sync),
            other => Err(format!("unknown applications sync policy: {other}")),
        }
    }
}
