//! JSON patch payloads for adding and removing finalizers.

use serde_json::json;

/// Finalizer guarding cleanup of status entries owned by the controller.
pub const STATUS_CLEANUP_FINALIZER: &str = "monitoring.coreos.com/status-cleanup";

pub fn has_finalizer(finalizers: &[String], name: &str) -> bool {
    finalizers.iter().any(|f| f == name)
}

/// Build the JSON patch adding `name` to `metadata.finalizers`.
///
/// Returns an empty vector when the finalizer is already present.
pub fn finalizer_add_patch(finalizers: &[String], name: &str) -> serde_json::Result<Vec<u8>> {
    if has_finalizer(finalizers, name) {
        return Ok(Vec::new());
    }
    let patch = if finalizers.is_empty() {
        json!([{ "op": "add", "path": "/metadata/finalizers", "value": [name] }])
    } else {
        json!([{ "op": "add", "path": "/metadata/finalizers/-", "value": name }])
    };
    serde_json::to_vec(&patch)
}

/// Build the JSON patch removing `name` from `metadata.finalizers`.
///
/// Returns `None` when the finalizer is absent.
pub fn finalizer_delete_patch(finalizers: &[String], name: &str) -> serde_json::Result<Option<Vec<u8>>> {
    match finalizers.iter().position(|f| f == name) {
        Some(idx) => {
            let patch = json!([{ "op": "remove", "path": format!("/metadata/finalizers/{}", idx) }]);
            serde_json::to_vec(&patch).map(Some)
        }
        None => Ok(None),
    }
}
