use std::fmt::Debug;

use async_trait::async_trait;
use converge_core::{Error, Result};
use kube::{
    api::{Api, PostParams},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};

/// Get/create/update access to one resource kind, typically bound to one
/// namespace.
///
/// Implementations must report a missing object as [`Error::NotFound`] and a
/// stale version token as [`Error::Conflict`].
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn get(&self, name: &str) -> Result<K>;
    async fn create(&self, obj: &K) -> Result<K>;
    /// Replace the stored object; `obj.metadata.resourceVersion` is the
    /// version the caller last read.
    async fn update(&self, obj: &K) -> Result<K>;
}

/// Map a kube client error onto the converge error kinds.
pub fn classify(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.reason == "NotFound" || (ae.reason.is_empty() && ae.code == 404) => Error::NotFound(ae.message),
        kube::Error::Api(ae) if ae.reason == "Conflict" || (ae.reason.is_empty() && ae.code == 409) => Error::Conflict(ae.message),
        other => Error::transport(other),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        Api::<K>::get(self, name).await.map_err(classify)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        Api::<K>::create(self, &PostParams::default(), obj).await.map_err(classify)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("object to update has no metadata.name".into()))?;
        Api::<K>::replace(self, name, &PostParams::default(), obj).await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{reason} ({code})"), reason: reason.into(), code })
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(classify(api_err(404, "NotFound")), Error::NotFound(m) if m == "NotFound (404)"));
        assert!(matches!(classify(api_err(409, "Conflict")), Error::Conflict(_)));
        assert!(matches!(classify(api_err(409, "")), Error::Conflict(_)));
        // Creating an existing object is a 409 too, but not a version conflict.
        assert!(matches!(classify(api_err(409, "AlreadyExists")), Error::Transport(_)));
        assert!(matches!(classify(api_err(500, "InternalError")), Error::Transport(_)));
    }

    #[test]
    fn transport_keeps_kube_error() {
        let e = classify(api_err(403, "Forbidden"));
        let src = std::error::Error::source(&e).expect("source");
        assert!(src.downcast_ref::<kube::Error>().is_some());
    }
}
