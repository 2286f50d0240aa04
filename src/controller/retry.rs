use std::future::Future;
use std::time::Duration;

use kube::api::{Api, PostParams};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Optimistic-concurrency retry budget: 5 attempts, 10ms between them,
/// with 10% jitter. Conflicts past the budget surface to the caller and
/// are retried by the work queue.
const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(10);
const CONFLICT_RETRY_JITTER: f64 = 0.1;

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn backoff() -> Duration {
    let jitter = rand::rng().random_range(0.0..CONFLICT_RETRY_JITTER);
    CONFLICT_RETRY_BASE.mul_f64(1.0 + jitter)
}

/// Run `op` until it succeeds or fails with something other than a write
/// conflict. The closure must re-read whatever it mutates on each attempt
/// so a retry sends a fresh resourceVersion.
pub async fn retry_on_conflict<T, F, Fut>(
    mut op: F,
) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err)
                if is_conflict(&err)
                    && attempt + 1 < CONFLICT_RETRY_ATTEMPTS =>
            {
                attempt += 1;
                debug!(attempt, "write conflict, retrying");
                tokio::time::sleep(backoff()).await;
            }
            other => return other,
        }
    }
}

/// Re-read the object, apply `mutate` to it, and replace its status,
/// retrying on conflict. Returns `Ok(None)` when the object is gone,
/// which is benign during teardown.
pub async fn update_status_on_conflict<K, F>(
    api: &Api<K>,
    name: &str,
    mut mutate: F,
) -> Result<Option<K>, kube::Error>
where
    K: Clone + std::fmt::Debug + Serialize + DeserializeOwned,
    F: FnMut(&mut K),
{
    let mut attempt = 0;
    loop {
        let mut latest = match api.get(name).await {
            Ok(obj) => obj,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        mutate(&mut latest);
        let body = serde_json::to_vec(&latest)
            .map_err(kube::Error::SerdeError)?;
        match api
            .replace_status(name, &PostParams::default(), body)
            .await
        {
            Ok(updated) => return Ok(Some(updated)),
            Err(err)
                if is_conflict(&err)
                    && attempt + 1 < CONFLICT_RETRY_ATTEMPTS =>
            {
                attempt += 1;
                debug!(attempt, %name, "status write conflict, retrying");
                tokio::time::sleep(backoff()).await;
            }
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}
