use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::application::{
    ApplicationSpec, HealthStatusCode, SyncStatusCode,
};
use crate::config::ApplicationsSyncPolicy;

/// Annotation a user sets on an ApplicationSet to force a reconcile. The
/// controller removes it once the forced pass has run.
pub const REFRESH_ANNOTATION: &str =
    "argocd.argoproj.io/application-set-refresh";

/// Annotation maintained by the notifications engine; always preserved on
/// generated applications so re-renders do not resend notifications.
pub const NOTIFIED_ANNOTATION: &str = "notified.notifications.argoproj.io";

#[derive(
    CustomResource,
    Deserialize,
    Serialize,
    Clone,
    Debug,
    Default,
    JsonSchema,
    PartialEq,
)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "ApplicationSet",
    plural = "applicationsets",
    namespaced,
    status = "ApplicationSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    #[serde(default)]
    pub generators: Vec<GeneratorSpec>,
    #[serde(default)]
    pub template: ApplicationSetTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<ApplicationSetSyncPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RolloutStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_fields: Option<PreservedFields>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_application_differences: Vec<IgnoreDifference>,
    /// When true, parameter maps keep their structure during template
    /// rendering; when false (the default) they are flattened to dotted
    /// string keys first.
    #[serde(default)]
    pub structured_params: bool,
}

/// One generator entry. Exactly one of the fields is expected to be set;
/// the registry dispatches on whichever one is.
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGeneratorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterGeneratorSpec>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ListGeneratorSpec {
    #[serde(default)]
    pub elements: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ApplicationSetTemplate>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGeneratorSpec {
    /// Restrict to cluster secrets carrying all of these labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ApplicationSetTemplate>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplate {
    #[serde(default)]
    pub metadata: ApplicationSetTemplateMeta,
    #[serde(default)]
    pub spec: ApplicationSpec,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplateMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSyncPolicy {
    /// Leave generated applications (and their deployed resources) in
    /// place when the ApplicationSet itself is deleted.
    #[serde(default)]
    pub preserve_resources_on_deletion: bool,
    /// Per-ApplicationSet override of the controller-level policy; only
    /// honored when the controller allows overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applications_sync: Option<ApplicationsSyncPolicy>,
}

/// Rollout strategy, a closed sum over the supported variants.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum RolloutStrategy {
    AllAtOnce,
    #[serde(rename_all = "camelCase")]
    RollingSync {
        #[serde(default)]
        steps: Vec<RolloutStep>,
        /// `Reverse` (matched case-insensitively) tears members down in
        /// reverse step order when the ApplicationSet is deleted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deletion_order: Option<String>,
    },
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::AllAtOnce
    }
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    #[serde(default)]
    pub match_expressions: Vec<MatchExpression>,
    /// Cap on members of this step that may be in flight at once, either
    /// an absolute count or a percentage of the step size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_update: Option<IntOrString>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct MatchExpression {
    #[serde(default)]
    pub key: String,
    /// `In` or `NotIn`; anything else disqualifies the expression.
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct PreservedFields {
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Fields excluded from the live-vs-desired spec comparison, addressed by
/// JSON pointer (e.g. `/syncPolicy/syncOptions`).
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreDifference {
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ApplicationSetCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_status: Vec<ApplicationSetApplicationStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetCondition {
    #[serde(rename = "type")]
    pub type_: ApplicationSetConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum ApplicationSetConditionType {
    ErrorOccurred,
    ParametersGenerated,
    ResourcesUpToDate,
    RolloutProgressing,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Rollout bookkeeping for one member application.
#[derive(
    Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetApplicationStatus {
    pub application: String,
    /// 1-based step the application is assigned to; `-1` when no step
    /// match expression selects it.
    #[serde(default = "default_step")]
    pub step: i64,
    pub status: RolloutPhase,
    #[serde(default)]
    pub message: String,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
    /// Revisions observed when the entry last left Waiting; a change here
    /// sends the application back to Waiting. `None` only on entries
    /// written before this field existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revisions: Option<Vec<String>>,
}

fn default_step() -> i64 {
    -1
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq,
)]
pub enum RolloutPhase {
    Waiting,
    Pending,
    Progressing,
    Healthy,
}

/// Health/sync snapshot of one member, kept on the parent for operators
/// that only look at the ApplicationSet.
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatusCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatusCode>,
}

impl ApplicationSet {
    /// Steps of the RollingSync strategy, when that strategy is selected.
    pub fn rolling_sync_steps(&self) -> Option<&[RolloutStep]> {
        match self.spec.strategy.as_ref() {
            Some(RolloutStrategy::RollingSync { steps, .. }) => {
                Some(steps.as_slice())
            }
            _ => None,
        }
    }

    /// True when the RollingSync strategy is selected at all.
    pub fn is_rolling_sync(&self) -> bool {
        self.rolling_sync_steps().is_some()
    }

    /// Progressive sync only engages when RollingSync has at least one
    /// step to assign members to.
    pub fn progressive_sync_enabled(&self) -> bool {
        self.rolling_sync_steps()
            .map(|steps| !steps.is_empty())
            .unwrap_or(false)
    }

    /// Reverse deletion order requested (case-insensitive), which only
    /// applies while progressive sync is enabled.
    pub fn reverse_deletion_order(&self) -> bool {
        if !self.progressive_sync_enabled() {
            return false;
        }
        match self.spec.strategy.as_ref() {
            Some(RolloutStrategy::RollingSync {
                deletion_order: Some(order),
                ..
            }) => order.eq_ignore_ascii_case("Reverse"),
            _ => false,
        }
    }

    pub fn refresh_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(REFRESH_ANNOTATION))
            .unwrap_or(false)
    }

    /// Policy in effect for this ApplicationSet: the controller-level
    /// policy, unless the spec carries an override and overrides are
    /// allowed.
    pub fn effective_policy(
        &self,
        controller_policy: ApplicationsSyncPolicy,
        allow_override: bool,
    ) -> ApplicationsSyncPolicy {
        if !allow_override {
            return controller_policy;
        }
        self.spec
            .sync_policy
            .as_ref()
            .and_then(|p| p.applications_sync)
            .unwrap_or(controller_policy)
    }

    pub fn find_application_status(
        &self,
        application: &str,
    ) -> Option<&ApplicationSetApplicationStatus> {
        self.status
            .as_ref()?
            .application_status
            .iter()
            .find(|s| s.application == application)
    }
}
