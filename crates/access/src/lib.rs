//! Converge access: decide whether the current identity holds a set of RBAC
//! grants, reporting every missing grant in one pass.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use converge_core::{Error, Result};
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use kube::{
    api::{Api, PostParams},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Namespace value meaning "all namespaces".
pub const NAMESPACE_ALL: &str = "";

/// Authorization attributes to check on one resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAttribute {
    pub resource: String,
    /// Empty means every object of the resource.
    pub name: String,
    pub group: String,
    pub version: String,
    pub verbs: Vec<String>,
}

impl ResourceAttribute {
    pub fn new(group: &str, resource: &str, verbs: &[&str]) -> Self {
        Self {
            resource: resource.to_string(),
            group: group.to_string(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// Parses `VERB[,VERB...]:RESOURCE[.GROUP][/NAME]`, e.g.
/// `get,list:statefulsets.apps` or `get:namespaces/monitoring`.
impl FromStr for ResourceAttribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (verbs, target) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("invalid attribute {:?} (expect verbs:resource[.group][/name])", s)))?;
        let verbs: Vec<String> = verbs.split(',').map(str::trim).filter(|v| !v.is_empty()).map(String::from).collect();
        if verbs.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid attribute {:?}: no verbs", s)));
        }
        let (res_group, name) = target.split_once('/').unwrap_or((target, ""));
        let (resource, group) = res_group.split_once('.').unwrap_or((res_group, ""));
        if resource.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid attribute {:?}: no resource", s)));
        }
        Ok(Self { resource: resource.into(), name: name.into(), group: group.into(), version: String::new(), verbs })
    }
}

/// One authorization question sent to the reviewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessQuery {
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub name: String,
    pub namespace: String,
}

/// A denied `(verb, resource, group, namespace)` combination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingPermission {
    pub verb: String,
    /// `resource` or `resource/name`.
    pub resource: String,
    pub group: String,
    /// `None` for all namespaces.
    pub namespace: Option<String>,
}

impl fmt::Display for MissingPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing {:?} permission on resource {:?} (group: {:?}) for ", self.verb, self.resource, self.group)?;
        match &self.namespace {
            None => write!(f, "all namespaces"),
            Some(ns) => write!(f, "namespace {:?}", ns),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionReport {
    pub allowed: bool,
    pub missing: Vec<MissingPermission>,
}

/// Answers authorization queries for the calling identity.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, query: &AccessQuery) -> Result<bool>;
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[async_trait]
impl AccessReviewer for Api<SelfSubjectAccessReview> {
    async fn review(&self, q: &AccessQuery) -> Result<bool> {
        let ra = ResourceAttributes {
            verb: non_empty(&q.verb),
            group: non_empty(&q.group),
            version: non_empty(&q.version),
            resource: non_empty(&q.resource),
            name: non_empty(&q.name),
            namespace: non_empty(&q.namespace),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
            ..Default::default()
        };
        let created = self.create(&PostParams::default(), &ssar).await.map_err(Error::transport)?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}

/// Reviewer backed by SelfSubjectAccessReview objects.
pub fn self_subject_reviewer(client: Client) -> Api<SelfSubjectAccessReview> {
    Api::all(client)
}

fn build_query(namespace: &str, ra: &ResourceAttribute, verb: &str) -> AccessQuery {
    let mut q = AccessQuery {
        verb: verb.to_string(),
        group: ra.group.clone(),
        version: ra.version.clone(),
        resource: ra.resource.clone(),
        name: ra.name.clone(),
        namespace: namespace.to_string(),
    };
    // A namespace object is reviewed inside itself.
    if q.group.is_empty() && q.resource == "namespaces" && !q.name.is_empty() && q.namespace.is_empty() {
        q.namespace = q.name.clone();
    }
    q
}

fn missing(namespace: &str, ra: &ResourceAttribute, verb: &str) -> MissingPermission {
    let resource = if ra.name.is_empty() { ra.resource.clone() } else { format!("{}/{}", ra.resource, ra.name) };
    MissingPermission {
        verb: verb.to_string(),
        resource,
        group: ra.group.clone(),
        namespace: if namespace == NAMESPACE_ALL { None } else { Some(namespace.to_string()) },
    }
}

/// Aggregates per-namespace, per-resource, per-verb reviews into one report.
pub struct PermissionChecker<R> {
    reviewer: R,
    cancel: CancellationToken,
}

impl<R: AccessReviewer> PermissionChecker<R> {
    pub fn new(reviewer: R) -> Self {
        Self { reviewer, cancel: CancellationToken::new() }
    }

    /// Abort in-flight and future checks once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn reviewer(&self) -> &R {
        &self.reviewer
    }

    /// Check every `namespaces × attributes × verbs` combination.
    ///
    /// An empty namespace list checks cluster-wide. Denials are collected,
    /// reviewer errors abort the whole check.
    pub async fn is_allowed(&self, namespaces: &[String], attributes: &[ResourceAttribute]) -> Result<PermissionReport> {
        if attributes.is_empty() {
            return Err(Error::InvalidArgument("resource attributes must not be empty".into()));
        }
        let all = [NAMESPACE_ALL.to_string()];
        let namespaces = if namespaces.is_empty() { &all[..] } else { namespaces };

        let mut report = PermissionReport::default();
        for ns in namespaces {
            for ra in attributes {
                for verb in &ra.verbs {
                    let q = build_query(ns, ra, verb);
                    counter!("permission_queries_total", 1u64);
                    let allowed = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        r = self.reviewer.review(&q) => r?,
                    };
                    if !allowed {
                        counter!("permission_denied_total", 1u64);
                        let m = missing(ns, ra, verb);
                        debug!(%m, "permission denied");
                        report.missing.push(m);
                    }
                }
            }
        }
        report.allowed = report.missing.is_empty();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attribute_strings() {
        let a: ResourceAttribute = "get,list,watch:statefulsets.apps".parse().unwrap();
        assert_eq!(a.resource, "statefulsets");
        assert_eq!(a.group, "apps");
        assert_eq!(a.verbs, vec!["get", "list", "watch"]);
        assert!(a.name.is_empty());

        let b: ResourceAttribute = "get:namespaces/monitoring".parse().unwrap();
        assert_eq!(b, ResourceAttribute::new("", "namespaces", &["get"]).named("monitoring"));

        let c: ResourceAttribute = "create:prometheuses.monitoring.coreos.com/k8s".parse().unwrap();
        assert_eq!(c.group, "monitoring.coreos.com");
        assert_eq!(c.name, "k8s");
    }

    #[test]
    fn rejects_malformed_attribute_strings() {
        assert!("pods".parse::<ResourceAttribute>().is_err());
        assert!(":pods".parse::<ResourceAttribute>().is_err());
        assert!("get:".parse::<ResourceAttribute>().is_err());
    }

    #[test]
    fn namespace_objects_are_reviewed_in_themselves() {
        let ra = ResourceAttribute::new("", "namespaces", &["get"]).named("monitoring");
        assert_eq!(build_query(NAMESPACE_ALL, &ra, "get").namespace, "monitoring");
        // An explicit namespace wins.
        assert_eq!(build_query("default", &ra, "get").namespace, "default");
        // Unnamed lookups stay cluster-wide.
        let all = ResourceAttribute::new("", "namespaces", &["list"]);
        assert_eq!(build_query(NAMESPACE_ALL, &all, "list").namespace, "");
    }

    #[test]
    fn missing_permission_display() {
        let ra = ResourceAttribute::new("apps", "statefulsets", &["update"]).named("web");
        assert_eq!(
            missing("", &ra, "update").to_string(),
            r#"missing "update" permission on resource "statefulsets/web" (group: "apps") for all namespaces"#
        );
        assert_eq!(
            missing("monitoring", &ra, "update").to_string(),
            r#"missing "update" permission on resource "statefulsets/web" (group: "apps") for namespace "monitoring""#
        );
    }
}
