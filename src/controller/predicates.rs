use std::collections::{BTreeMap, HashMap};

use futures_util::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};

use crate::crd::app_set::REFRESH_ANNOTATION;
use crate::crd::{Application, ApplicationSet};

fn annotations_or_default(meta: &kube::core::ObjectMeta) -> BTreeMap<String, String> {
    meta.annotations.clone().unwrap_or_default()
}

fn labels_or_default(meta: &kube::core::ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

fn finalizers_or_default(meta: &kube::core::ObjectMeta) -> Vec<String> {
    meta.finalizers.clone().unwrap_or_default()
}

/// Whether this controller serves the given namespace. An empty allow-list
/// serves everything; `*` matches any namespace.
pub fn is_namespace_allowed(allowed: &[String], namespace: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|ns| ns == "*" || ns == namespace)
}

/// Whether a member application update warrants reconciling its parent.
///
/// This controller owns the application spec, labels, annotations and
/// finalizers; everything else (bookkeeping the application controller
/// writes) is ignored. With progressive sync enabled the rollout state
/// machine additionally feeds on health, sync and operation phase, so
/// changes there trigger too. Empty and absent maps compare equal.
pub fn should_requeue_for_application(
    old: &Application,
    new: &Application,
    progressive: bool,
) -> bool {
    if old.spec != new.spec
        || annotations_or_default(&old.metadata)
            != annotations_or_default(&new.metadata)
        || labels_or_default(&old.metadata)
            != labels_or_default(&new.metadata)
        || finalizers_or_default(&old.metadata)
            != finalizers_or_default(&new.metadata)
    {
        return true;
    }

    if progressive {
        if old.health_status() != new.health_status()
            || old.sync_status() != new.sync_status()
        {
            return true;
        }
        let op_fields = |app: &Application| {
            app.status
                .as_ref()
                .and_then(|s| s.operation_state.as_ref())
                .map(|o| (o.phase.clone(), o.started_at.clone()))
        };
        if op_fields(old) != op_fields(new) {
            return true;
        }
    }

    false
}

/// Whether an ApplicationSet update warrants a reconcile. Status is owned
/// by this controller and does not requeue, with one exception: progressive
/// sync advances by observing its own applicationStatus bookkeeping.
/// Removing the refresh annotation is the controller acknowledging a
/// forced refresh and must not requeue, or every refresh would run twice.
pub fn should_requeue_for_application_set(
    old: &ApplicationSet,
    new: &ApplicationSet,
    progressive: bool,
) -> bool {
    if progressive {
        let app_statuses = |a: &ApplicationSet| {
            a.status
                .as_ref()
                .map(|s| s.application_status.clone())
                .unwrap_or_default()
        };
        if app_statuses(old) != app_statuses(new) {
            return true;
        }
    }

    if old.spec != new.spec
        || labels_or_default(&old.metadata)
            != labels_or_default(&new.metadata)
        || finalizers_or_default(&old.metadata)
            != finalizers_or_default(&new.metadata)
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
    {
        return true;
    }

    let old_ann = annotations_or_default(&old.metadata);
    let new_ann = annotations_or_default(&new.metadata);
    if old_ann != new_ann {
        let strip = |ann: &BTreeMap<String, String>| {
            let mut ann = ann.clone();
            ann.remove(REFRESH_ANNOTATION);
            ann
        };
        let refresh_removed = old_ann.contains_key(REFRESH_ANNOTATION)
            && !new_ann.contains_key(REFRESH_ANNOTATION);
        if refresh_removed && strip(&old_ann) == strip(&new_ann) {
            return false;
        }
        return true;
    }

    false
}

fn cache_key<K: Resource>(obj: &K) -> String
where
    K::DynamicType: Default,
{
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Reflector-backed trigger stream for ApplicationSets. The first sighting
/// of an object always triggers; afterwards only changes that pass
/// [`should_requeue_for_application_set`] do.
pub fn application_set_trigger_stream(
    api: Api<ApplicationSet>,
    cfg: watcher::Config,
    allowed_namespaces: Vec<String>,
    progressive: bool,
) -> (
    Store<ApplicationSet>,
    impl Stream<Item = Result<ApplicationSet, watcher::Error>>,
) {
    let (reader, writer) = reflector::store();
    let mut seen: HashMap<String, ApplicationSet> = HashMap::new();
    let stream = reflector::reflector(writer, watcher::watcher(api, cfg))
        .default_backoff()
        .filter_map(move |event| {
            let out = match event {
                Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                    if !is_namespace_allowed(
                        &allowed_namespaces,
                        &obj.namespace().unwrap_or_default(),
                    ) {
                        None
                    } else {
                        let key = cache_key(&obj);
                        let trigger = match seen.get(&key) {
                            None => true,
                            Some(old) => should_requeue_for_application_set(
                                old,
                                &obj,
                                progressive,
                            ),
                        };
                        seen.insert(key, obj.clone());
                        trigger.then_some(Ok(obj))
                    }
                }
                Ok(Event::Delete(obj)) => {
                    seen.remove(&cache_key(&obj));
                    Some(Ok(obj))
                }
                Ok(Event::Init) | Ok(Event::InitDone) => None,
                Err(err) => Some(Err(err)),
            };
            futures_util::future::ready(out)
        });
    (reader, stream)
}

/// Trigger stream for owned Applications. A create event is this
/// controller observing its own write and never triggers; deletes always
/// do; updates go through [`should_requeue_for_application`].
pub fn application_trigger_stream(
    api: Api<Application>,
    cfg: watcher::Config,
    allowed_namespaces: Vec<String>,
    progressive: bool,
) -> impl Stream<Item = Result<Application, watcher::Error>> {
    let mut seen: HashMap<String, Application> = HashMap::new();
    watcher::watcher(api, cfg)
        .default_backoff()
        .filter_map(move |event| {
            let out = match event {
                Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                    if !is_namespace_allowed(
                        &allowed_namespaces,
                        &obj.namespace().unwrap_or_default(),
                    ) {
                        None
                    } else {
                        let key = cache_key(&obj);
                        let trigger = match seen.get(&key) {
                            None => false,
                            Some(old) => should_requeue_for_application(
                                old,
                                &obj,
                                progressive,
                            ),
                        };
                        seen.insert(key, obj.clone());
                        trigger.then_some(Ok(obj))
                    }
                }
                Ok(Event::Delete(obj)) => {
                    seen.remove(&cache_key(&obj));
                    Some(Ok(obj))
                }
                Ok(Event::Init) | Ok(Event::InitDone) => None,
                Err(err) => Some(Err(err)),
            };
            futures_util::future::ready(out)
        })
}
