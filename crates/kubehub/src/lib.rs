//! Converge kubehub – client construction, object store accessors and
//! discovery helpers on top of kube-rs.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use tracing::{debug, info};

mod registry;
mod store;

pub use registry::{KindDescriptor, KindRegistry};
pub use store::{classify, ObjectStore};

/// Environment variable optionally pointing at a kubeconfig file.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// How to reach the cluster API.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// API server URL; ignored when a kubeconfig is in use.
    pub host: Option<String>,
    /// Only honoured for `https` hosts.
    pub accept_invalid_certs: bool,
    /// Impersonated user name.
    pub as_user: Option<String>,
    /// Falls back to `$KUBECONFIG` when unset.
    pub kubeconfig_path: Option<PathBuf>,
}

/// Resolve a client configuration.
///
/// Order: explicit kubeconfig path, `$KUBECONFIG`, explicit host, in-cluster
/// service account.
pub async fn new_cluster_config(cfg: &ClusterConfig) -> Result<kube::Config> {
    let kubeconfig_path = cfg
        .kubeconfig_path
        .clone()
        .or_else(|| std::env::var_os(KUBECONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));

    let mut config = if let Some(path) = kubeconfig_path {
        let kc = Kubeconfig::read_from(&path).with_context(|| format!("error reading kubeconfig {}", path.display()))?;
        info!(path = %path.display(), "using kubeconfig");
        kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("error creating config from {}", path.display()))?
    } else {
        match cfg.host.as_deref().filter(|h| !h.is_empty()) {
            None => {
                debug!("no kubeconfig or host given; using in-cluster config");
                kube::Config::incluster().context("loading in-cluster config")?
            }
            Some(host) => {
                let mut c = kube::Config::new(host.parse().with_context(|| format!("error parsing host url {}", host))?);
                if c.cluster_url.scheme_str() == Some("https") {
                    c.accept_invalid_certs = cfg.accept_invalid_certs;
                }
                c
            }
        }
    };

    if let Some(user) = cfg.as_user.as_deref().filter(|u| !u.is_empty()) {
        config.auth_info.impersonate = Some(user.to_string());
    }
    Ok(config)
}

pub async fn new_client(cfg: &ClusterConfig) -> Result<Client> {
    let config = new_cluster_config(cfg).await?;
    Client::try_from(config).context("building kube client")
}

/// True when the API server answered 404 with reason `NotFound`.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404 && ae.reason == "NotFound")
}

/// Whether `resource` is served under `group_version` (e.g. `"v1"` or
/// `"monitoring.coreos.com/v1"`).
pub async fn is_api_group_version_resource_supported(client: &Client, group_version: &str, resource: &str) -> Result<bool> {
    let listed = if group_version.contains('/') {
        client.list_api_group_resources(group_version).await
    } else {
        client.list_core_api_resources(group_version).await
    };
    let list = match listed {
        Ok(list) => list,
        Err(e) if is_not_found(&e) => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("listing resources for {}", group_version)),
    };
    Ok(list.resources.iter().any(|r| r.name == resource))
}

/// Whether a pod is running and its `Ready` condition is true.
///
/// Completed pods are an error since they will never become ready.
pub fn pod_running_and_ready(pod: &Pod) -> Result<bool> {
    let status = match pod.status.as_ref() {
        Some(s) => s,
        None => return Ok(false),
    };
    match status.phase.as_deref() {
        Some(phase @ ("Failed" | "Succeeded")) => Err(anyhow!("pod completed with phase {}", phase)),
        Some("Running") => status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status == "True")
            .ok_or_else(|| anyhow!("pod ready condition not found")),
        _ => Ok(false),
    }
}
