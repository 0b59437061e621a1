//! Converge apply: optimistic create-or-update of managed objects.
//!
//! Every operation follows the same protocol: read the stored object, merge
//! the fields other actors own into the desired object, submit the result
//! with the version token just read and start over on a conflict. Objects
//! are never cached between attempts.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;

use converge_core::{Error, Result};
use converge_kubehub::ObjectStore;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, StatefulSet},
    core::v1::{Endpoints, Secret, Service},
    discovery::v1::EndpointSlice,
};
use kube::{Resource, ResourceExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod merge;
pub mod retry;

pub use merge::EXTERNALLY_MANAGED_PREFIX;
pub use retry::{retry_on_conflict, Attempt, RetryPolicy};

/// What a create-or-update call did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied<K> {
    Created(K),
    Updated(K),
    /// The stored object already matched; no write was issued.
    Unchanged,
}

impl<K> Applied<K> {
    /// The object returned by the store, if a write happened.
    pub fn into_inner(self) -> Option<K> {
        match self {
            Applied::Created(k) | Applied::Updated(k) => Some(k),
            Applied::Unchanged => None,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnMissing {
    Create,
    Fail,
}

/// Whether a merged object still has to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Needed,
    Skip,
}

/// Converges stored objects toward desired ones under conflict retries.
#[derive(Debug, Clone)]
pub struct MergeUpdater {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Default for MergeUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeUpdater {
    /// Retry policy taken from the environment (see [`RetryPolicy::from_env`]).
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::from_env())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self { policy, cancel: CancellationToken::new() }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = fut => r,
        }
    }

    async fn converge<K, S, M>(&self, store: &S, desired: &K, on_missing: OnMissing, carry: M) -> Result<Applied<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync,
        S: ObjectStore<K> + ?Sized,
        M: Fn(&K, &mut K) -> Write,
    {
        let name = desired.meta().name.as_deref().unwrap_or_default();
        let kind = K::kind(&()).into_owned();
        let kind = kind.as_str();
        let carry = &carry;
        retry_on_conflict(&self.policy, &self.cancel, move || async move {
            let current = match self.call(store.get(name)).await {
                Ok(c) => c,
                Err(Error::NotFound(msg)) if on_missing == OnMissing::Create => {
                    debug!(%kind, %name, %msg, "not found; creating");
                    let r = self.call(store.create(desired)).await;
                    if r.is_ok() {
                        counter!("merge_create_total", 1u64);
                        info!(%kind, %name, "created");
                    }
                    return Attempt::from(r.map(Applied::Created));
                }
                Err(e) => return Attempt::Fatal(e),
            };

            let mut merged = desired.clone();
            merge::merge_metadata(merged.meta_mut(), current.meta());
            if carry(&current, &mut merged) == Write::Skip {
                counter!("merge_noop_total", 1u64);
                debug!(%kind, %name, "already up to date");
                return Attempt::Done(Applied::Unchanged);
            }

            let r = self.call(store.update(&merged)).await;
            if let Ok(updated) = &r {
                counter!("merge_update_total", 1u64);
                debug!(%kind, %name, rv = ?updated.meta().resource_version, "updated");
            }
            Attempt::from(r.map(Applied::Updated))
        })
        .await
    }

    /// Create or update a service, keeping the cluster-assigned IP fields.
    pub async fn create_or_update_service<S>(&self, store: &S, svc: &Service) -> Result<Applied<Service>>
    where
        S: ObjectStore<Service> + ?Sized,
    {
        self.converge(store, svc, OnMissing::Create, |cur, m| {
            merge::carry_service_fields(m, cur);
            Write::Needed
        })
        .await
    }

    pub async fn create_or_update_endpoints<S>(&self, store: &S, eps: &Endpoints) -> Result<Applied<Endpoints>>
    where
        S: ObjectStore<Endpoints> + ?Sized,
    {
        self.converge(store, eps, OnMissing::Create, |_, _| Write::Needed).await
    }

    /// A slice without a name relies on `generateName` and is always created.
    pub async fn create_or_update_endpoint_slice<S>(&self, store: &S, slice: &EndpointSlice) -> Result<Applied<EndpointSlice>>
    where
        S: ObjectStore<EndpointSlice> + ?Sized,
    {
        if slice.metadata.name.as_deref().unwrap_or_default().is_empty() {
            let created = self.call(store.create(slice)).await?;
            counter!("merge_create_total", 1u64);
            info!(kind = "EndpointSlice", name = %created.name_any(), "created");
            return Ok(Applied::Created(created));
        }
        self.converge(store, slice, OnMissing::Create, |_, _| Write::Needed).await
    }

    /// Update an existing stateful set; a missing one is reported as
    /// [`Error::NotFound`], never created.
    pub async fn update_stateful_set<S>(&self, store: &S, sset: &StatefulSet) -> Result<Applied<StatefulSet>>
    where
        S: ObjectStore<StatefulSet> + ?Sized,
    {
        self.converge(store, sset, OnMissing::Fail, |cur, m| {
            if let (Some(cur_spec), Some(spec)) = (cur.spec.as_ref(), m.spec.as_mut()) {
                merge::merge_template_annotations(&mut spec.template, &cur_spec.template);
            }
            Write::Needed
        })
        .await
    }

    pub async fn update_daemon_set<S>(&self, store: &S, dset: &DaemonSet) -> Result<Applied<DaemonSet>>
    where
        S: ObjectStore<DaemonSet> + ?Sized,
    {
        self.converge(store, dset, OnMissing::Fail, |cur, m| {
            if let (Some(cur_spec), Some(spec)) = (cur.spec.as_ref(), m.spec.as_mut()) {
                merge::merge_template_annotations(&mut spec.template, &cur_spec.template);
            }
            Write::Needed
        })
        .await
    }

    /// Create or update a secret; no write is issued when the merged secret
    /// matches the stored one.
    pub async fn create_or_update_secret<S>(&self, store: &S, secret: &Secret) -> Result<Applied<Secret>>
    where
        S: ObjectStore<Secret> + ?Sized,
    {
        self.converge(store, secret, OnMissing::Create, |cur, m| {
            if merge::secret_content_eq(cur, m) {
                Write::Skip
            } else {
                Write::Needed
            }
        })
        .await
    }

    /// Check that a user-provided governing service exists and selects pods
    /// carrying `pod_labels`.
    pub async fn ensure_custom_governing_service<S>(&self, store: &S, namespace: &str, service_name: &str, pod_labels: &BTreeMap<String, String>) -> Result<()>
    where
        S: ObjectStore<Service> + ?Sized,
    {
        let svc = self.call(store.get(service_name)).await.map_err(|e| match e {
            Error::NotFound(msg) => Error::NotFound(format!("failed to get custom governing service {}/{}: {}", namespace, service_name, msg)),
            other => other,
        })?;
        let selector = svc.spec.and_then(|s| s.selector).unwrap_or_default();
        let selects = selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v));
        if !selects {
            return Err(Error::InvalidArgument(format!(
                "custom governing service {}/{} with selector {:?} does not select pods with labels {:?}",
                namespace,
                service_name,
                render_labels(&selector),
                render_labels(pod_labels)
            )));
        }
        Ok(())
    }
}

fn render_labels(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}
