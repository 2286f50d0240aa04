use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::warn;

use crate::crd::ApplicationDestination;

/// Label selecting the secrets that register destination clusters.
pub const CLUSTER_SECRET_SELECTOR: &str =
    "argocd.argoproj.io/secret-type=cluster";

pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";
pub const IN_CLUSTER_NAME: &str = "in-cluster";

/// One registered destination cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSpecifier {
    pub name: String,
    pub server: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveErr {
    #[error("application destination can't have both name and server defined: {name} {server}")]
    NameAndServer { name: String, server: String },
    #[error("application destination has neither name nor server")]
    Empty,
    #[error("there are no clusters with this name: {0}")]
    NameNotFound(String),
    #[error("there are no clusters with this URL: {0}")]
    ServerNotFound(String),
}

/// List the registered clusters: every labeled cluster secret plus the
/// implicit in-cluster entry (unless a secret re-registers it).
pub async fn list_clusters(
    client: Client,
    namespace: &str,
) -> Result<Vec<ClusterSpecifier>, kube::Error> {
    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    let lp = ListParams::default().labels(CLUSTER_SECRET_SELECTOR);
    let mut clusters = Vec::new();
    for secret in secrets.list(&lp).await? {
        match cluster_from_secret(&secret) {
            Some(cluster) => clusters.push(cluster),
            None => warn!(
                secret = %secret.name_any(),
                "cluster secret is missing name or server data; skipping"
            ),
        }
    }
    if !clusters.iter().any(|c| c.server == IN_CLUSTER_SERVER) {
        clusters.push(ClusterSpecifier {
            name: IN_CLUSTER_NAME.to_string(),
            server: IN_CLUSTER_SERVER.to_string(),
        });
    }
    Ok(clusters)
}

fn cluster_from_secret(secret: &Secret) -> Option<ClusterSpecifier> {
    let data = secret.data.as_ref()?;
    let field = |key: &str| {
        data.get(key)
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
    };
    Some(ClusterSpecifier {
        name: field("name")?,
        server: field("server")?,
    })
}

/// Resolve a destination to a registered cluster, by server URL or by
/// cluster name (exactly one of the two must be set).
pub fn resolve_destination<'a>(
    destination: &ApplicationDestination,
    clusters: &'a [ClusterSpecifier],
) -> Result<&'a ClusterSpecifier, ResolveErr> {
    let server = destination.server.as_deref().filter(|s| !s.is_empty());
    let name = destination.name.as_deref().filter(|n| !n.is_empty());
    match (server, name) {
        (Some(server), Some(name)) => Err(ResolveErr::NameAndServer {
            name: name.to_string(),
            server: server.to_string(),
        }),
        (Some(server), None) => clusters
            .iter()
            .find(|c| c.server == server)
            .ok_or_else(|| ResolveErr::ServerNotFound(server.to_string())),
        (None, Some(name)) => clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ResolveErr::NameNotFound(name.to_string())),
        (None, None) => Err(ResolveErr::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Vec<ClusterSpecifier> {
        vec![
            ClusterSpecifier {
                name: "in-cluster".into(),
                server: IN_CLUSTER_SERVER.into(),
            },
            ClusterSpecifier {
                name: "staging".into(),
                server: "https://staging.example.com".into(),
            },
        ]
    }

    fn dest(server: Option<&str>, name: Option<&str>) -> ApplicationDestination {
        ApplicationDestination {
            server: server.map(str::to_string),
            name: name.map(str::to_string),
            namespace: None,
        }
    }

    #[test]
    fn resolves_by_server_url() {
        let clusters = registry();
        let found = resolve_destination(
            &dest(Some("https://staging.example.com"), None),
            &clusters,
        )
        .unwrap();
        assert_eq!(found.name, "staging");
    }

    #[test]
    fn resolves_by_cluster_name() {
        let clusters = registry();
        let found =
            resolve_destination(&dest(None, Some("in-cluster")), &clusters)
                .unwrap();
        assert_eq!(found.server, IN_CLUSTER_SERVER);
    }

    #[test]
    fn rejects_both_name_and_server() {
        let clusters = registry();
        let err = resolve_destination(
            &dest(Some("https://staging.example.com"), Some("staging")),
            &clusters,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveErr::NameAndServer { .. }));
    }

    #[test]
    fn unknown_destinations_fail() {
        let clusters = registry();
        assert!(matches!(
            resolve_destination(&dest(None, Some("prod")), &clusters),
            Err(ResolveErr::NameNotFound(_))
        ));
        assert!(matches!(
            resolve_destination(
                &dest(Some("https://other.example.com"), None),
                &clusters
            ),
            Err(ResolveErr::ServerNotFound(_))
        ));
        assert!(matches!(
            resolve_destination(&dest(None, None), &clusters),
            Err(ResolveErr::Empty)
        ));
    }
}
