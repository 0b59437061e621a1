//! Field-preservation rules applied between the stored object and the desired
//! one before every update.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodTemplateSpec, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;

/// Pod-template annotations under this prefix are written out of band
/// (e.g. `kubectl rollout restart`) and survive reconciliation.
pub const EXTERNALLY_MANAGED_PREFIX: &str = "kubectl.kubernetes.io/";

type StringMap = BTreeMap<String, String>;

/// Existing references first, then desired ones not already present.
pub fn merge_owner_references(existing: &[OwnerReference], desired: &[OwnerReference]) -> Vec<OwnerReference> {
    let mut out = existing.to_vec();
    for r in desired {
        if !out.contains(r) {
            out.push(r.clone());
        }
    }
    out
}

/// Desired entries win; existing keys absent from `desired` are kept.
pub fn merge_maps(desired: Option<&StringMap>, existing: Option<&StringMap>) -> Option<StringMap> {
    merge_maps_by_prefix(desired, existing, "")
}

/// Copy the entries of `from` whose key starts with `prefix` over `to`.
fn merge_maps_by_prefix(from: Option<&StringMap>, to: Option<&StringMap>, prefix: &str) -> Option<StringMap> {
    let mut out = to.cloned().unwrap_or_default();
    for (k, v) in from.into_iter().flatten() {
        if k.starts_with(prefix) {
            out.insert(k.clone(), v.clone());
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

/// Carry the version token, owner references, labels and annotations of the
/// stored object into `desired`.
pub fn merge_metadata(desired: &mut ObjectMeta, existing: &ObjectMeta) {
    desired.resource_version = existing.resource_version.clone();
    desired.owner_references = non_empty(merge_owner_references(
        existing.owner_references.as_deref().unwrap_or_default(),
        desired.owner_references.as_deref().unwrap_or_default(),
    ));
    desired.labels = merge_maps(desired.labels.as_ref(), existing.labels.as_ref());
    desired.annotations = merge_maps(desired.annotations.as_ref(), existing.annotations.as_ref());
}

/// Keep the stored template's externally managed annotations.
pub fn merge_template_annotations(desired: &mut PodTemplateSpec, existing: &PodTemplateSpec) {
    let from = existing.metadata.as_ref().and_then(|m| m.annotations.as_ref());
    if from.is_none() {
        return;
    }
    let meta = desired.metadata.get_or_insert_with(Default::default);
    meta.annotations = merge_maps_by_prefix(from, meta.annotations.as_ref(), EXTERNALLY_MANAGED_PREFIX);
}

/// Cluster IP assignment and IP family fields are owned by the API server.
pub fn carry_service_fields(desired: &mut Service, existing: &Service) {
    let cur = existing.spec.clone().unwrap_or_default();
    let spec = desired.spec.get_or_insert_with(Default::default);
    spec.ip_families = cur.ip_families;
    spec.ip_family_policy = cur.ip_family_policy;
    spec.cluster_ip = cur.cluster_ip;
    spec.cluster_ips = cur.cluster_ips;
}

/// Secret payload as the API server stores it: `stringData` entries are
/// folded into `data` as UTF-8 bytes and win over `data` on collision.
pub fn effective_secret_data(secret: &Secret) -> BTreeMap<String, ByteString> {
    let mut data = secret.data.clone().unwrap_or_default();
    for (k, v) in secret.string_data.iter().flatten() {
        data.insert(k.clone(), ByteString(v.clone().into_bytes()));
    }
    data
}

/// Semantic equality of the fields a secret update can change.
pub fn secret_content_eq(a: &Secret, b: &Secret) -> bool {
    fn map_eq(x: Option<&StringMap>, y: Option<&StringMap>) -> bool {
        x.filter(|m| !m.is_empty()) == y.filter(|m| !m.is_empty())
    }
    let owners = |s: &Secret| s.metadata.owner_references.clone().unwrap_or_default();
    map_eq(a.metadata.labels.as_ref(), b.metadata.labels.as_ref())
        && map_eq(a.metadata.annotations.as_ref(), b.metadata.annotations.as_ref())
        && owners(a) == owners(b)
        && a.type_.as_deref().unwrap_or("Opaque") == b.type_.as_deref().unwrap_or("Opaque")
        && a.immutable.unwrap_or(false) == b.immutable.unwrap_or(false)
        && effective_secret_data(a) == effective_secret_data(b)
}
