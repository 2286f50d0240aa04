use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::NamespaceResourceScope;
use kube::core::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer that gates application deletion on resource cleanup in the
/// destination cluster.
pub const RESOURCES_FINALIZER: &str =
    "resources-finalizer.argocd.argoproj.io";

/// Finalizers with this prefix run hooks after the application is deleted.
/// They are owned by the application controller and must survive template
/// re-renders.
pub const POST_DELETE_FINALIZER_PREFIX: &str =
    "post-delete-finalizer.argocd.argoproj.io";

/// A single member application produced from an `ApplicationSet` template.
///
/// The `operation` field lives next to `spec`/`status` on the wire, which
/// rules out the `CustomResource` derive; `kube::Resource` is implemented by
/// hand below.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub metadata: ObjectMeta,
    pub spec: ApplicationSpec,
    /// One-shot sync trigger. Set by this controller for RollingSync
    /// members; cleared by the application controller once acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
}

impl kube::Resource for Application {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Application".into()
    }
    fn group(_: &()) -> Cow<'_, str> {
        "argoproj.io".into()
    }
    fn version(_: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }
    fn plural(_: &()) -> Cow<'_, str> {
        "applications".into()
    }
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Application {
    /// `namespace/name`, the key used for validation error bookkeeping.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or("")
        )
    }

    pub fn labels_or_default(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    pub fn health_status(&self) -> HealthStatusCode {
        self.status
            .as_ref()
            .map(|s| s.health.status.clone())
            .unwrap_or_default()
    }

    pub fn sync_status(&self) -> SyncStatusCode {
        self.status
            .as_ref()
            .map(|s| s.sync.status.clone())
            .unwrap_or_default()
    }

    /// Phase of the in-flight or last operation; `None` when the
    /// application controller has not recorded any operation yet.
    pub fn operation_phase(&self) -> Option<OperationPhase> {
        self.status
            .as_ref()
            .and_then(|s| s.operation_state.as_ref())
            .map(|o| o.phase.clone())
    }

    /// Revisions the application is being reconciled towards.
    pub fn target_revisions(&self) -> Vec<String> {
        let Some(status) = self.status.as_ref() else {
            return Vec::new();
        };
        if !status.sync.revisions.is_empty() {
            return status.sync.revisions.clone();
        }
        match status.sync.revision.as_deref() {
            Some(rev) if !rev.is_empty() => vec![rev.to_string()],
            _ => Vec::new(),
        }
    }
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    #[serde(default)]
    pub destination: ApplicationDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSyncPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

impl SyncPolicy {
    pub fn is_automated_sync_enabled(&self) -> bool {
        self.automated.is_some()
    }
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSyncPolicy {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    #[serde(default)]
    pub limit: i64,
}

/// A sync operation requested on an application, recorded at the top level
/// of the object rather than in its spec.
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub initiated_by: OperationInitiator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<OperationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncOperation>,
    #[serde(default)]
    pub retry: RetryStrategy,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct OperationInitiator {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub automated: bool,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub name: String,
    pub value: String,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    #[serde(default)]
    pub prune: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_options: Option<Vec<String>>,
}

/// Status is owned by the application controller; this controller only
/// reads it to drive the rollout state machine.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub sync: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    #[serde(default)]
    pub status: HealthStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema,
)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(default)]
    pub status: SyncStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema,
)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    #[serde(default)]
    pub phase: OperationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
    Error,
    Terminating,
    #[default]
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_revisions_prefers_revision_list() {
        let mut app = Application::default();
        app.status = Some(ApplicationStatus {
            sync: SyncStatus {
                status: SyncStatusCode::Synced,
                revision: Some("abc".into()),
                revisions: vec!["r1".into(), "r2".into()],
            },
            ..Default::default()
        });
        assert_eq!(app.target_revisions(), vec!["r1", "r2"]);
    }

    #[test]
    fn target_revisions_falls_back_to_single_revision() {
        let mut app = Application::default();
        app.status = Some(ApplicationStatus {
            sync: SyncStatus {
                revision: Some("abc".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(app.target_revisions(), vec!["abc"]);
        app.status = None;
        assert!(app.target_revisions().is_empty());
    }

    #[test]
    fn operation_phase_absent_without_operation_state() {
        let app = Application::default();
        assert_eq!(app.operation_phase(), None);
    }

    #[test]
    fn unknown_health_value_deserializes_to_unknown() {
        let code: HealthStatusCode =
            serde_json::from_value(serde_json::json!("SomethingNew")).unwrap();
        assert_eq!(code, HealthStatusCode::Unknown);
    }
}
