use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder};

use crate::crd::ApplicationSet;

pub const REASON_CREATED: &str = "Created";
pub const REASON_UPDATED: &str = "Updated";
pub const REASON_DELETED: &str = "Deleted";

pub fn build_obj_ref(appset: &ApplicationSet) -> ObjectReference {
    ObjectReference {
        api_version: Some("argoproj.io/v1alpha1".into()),
        kind: Some("ApplicationSet".into()),
        name: appset.metadata.name.clone(),
        namespace: appset.metadata.namespace.clone(),
        uid: appset.meta().uid.clone(),
        ..Default::default()
    }
}

pub async fn emit_event(
    recorder: &Recorder,
    reference: &ObjectReference,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            reference,
        )
        .await;
}
