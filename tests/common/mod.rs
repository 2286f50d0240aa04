#![allow(dead_code)]

use std::time::Duration;

use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;

use appset_controller::crd::app_project::{AppProject, AppProjectSpec};
use appset_controller::crd::{Application, ApplicationSet};

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

// Env guard utilities
pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}
impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}
pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}

/// Make sure the project referenced by generated applications exists.
pub async fn ensure_project(client: Client, ns: &str, name: &str) {
    let api: Api<AppProject> = Api::namespaced(client, ns);
    let project = AppProject::new(name, AppProjectSpec::default());
    let _ = api.create(&PostParams::default(), &project).await;
}

pub async fn wait_for_applications(
    client: Client,
    ns: &str,
    expected: &[&str],
    attempts: usize,
) -> bool {
    let api: Api<Application> = Api::namespaced(client, ns);
    for _ in 0..attempts {
        if let Ok(list) = api.list(&Default::default()).await {
            let names: Vec<String> =
                list.items.iter().map(|a| a.name_any()).collect();
            if expected.iter().all(|e| names.contains(&e.to_string())) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    false
}

pub async fn cleanup(ns: &str, name: &str, client: Client) {
    let appsets: Api<ApplicationSet> = Api::namespaced(client.clone(), ns);
    let _ = appsets.delete(name, &DeleteParams::default()).await;
    let apps: Api<Application> = Api::namespaced(client, ns);
    if let Ok(list) = apps.list(&Default::default()).await {
        for app in list {
            let owned = app.owner_references().iter().any(|or| {
                or.kind == "ApplicationSet" && or.name == name
            });
            if owned {
                let _ = apps
                    .delete(&app.name_any(), &DeleteParams::default())
                    .await;
            }
        }
    }
}

// RAII guard to ensure controller abort + cleanup
pub struct ControllerGuard {
    ns: String,
    name: String,
    client: Client,
    ctrl: Option<JoinHandle<()>>,
}

impl ControllerGuard {
    pub fn new(ns: &str, name: &str, client: Client) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            client,
            ctrl: None,
        }
    }
    pub fn with_controller(mut self, ctrl: JoinHandle<()>) -> Self {
        self.ctrl = Some(ctrl);
        self
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        if let Some(ref handle) = self.ctrl {
            handle.abort();
        }
        let ns = self.ns.clone();
        let name = self.name.clone();
        let client = self.client.clone();
        let _ = tokio::spawn(async move {
            cleanup(&ns, &name, client).await;
        });
    }
}
