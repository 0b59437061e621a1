use std::any::{type_name, TypeId};
use std::collections::HashMap;

use converge_core::{Error, Result};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, StatefulSet},
    authorization::v1::SelfSubjectAccessReview,
    core::v1::{Endpoints, Namespace, Pod, Secret, Service},
    discovery::v1::EndpointSlice,
};
use kube::Resource;
use serde::{Deserialize, Serialize};

/// Group/version/kind of a registered Rust type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl KindDescriptor {
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Explicit type → kind table, built once at start-up and passed around by
/// reference.
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    kinds: HashMap<TypeId, KindDescriptor>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind the reconciliation primitives touch.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register::<Service>()
            .register::<Endpoints>()
            .register::<EndpointSlice>()
            .register::<StatefulSet>()
            .register::<DaemonSet>()
            .register::<Secret>()
            .register::<Pod>()
            .register::<Namespace>()
            .register::<SelfSubjectAccessReview>();
        r
    }

    pub fn register<K: Resource<DynamicType = ()> + 'static>(&mut self) -> &mut Self {
        self.kinds.insert(TypeId::of::<K>(), KindDescriptor::of::<K>());
        self
    }

    /// Register a type that does not implement [`Resource`] itself.
    pub fn register_as<T: 'static>(&mut self, descriptor: KindDescriptor) -> &mut Self {
        self.kinds.insert(TypeId::of::<T>(), descriptor);
        self
    }

    pub fn lookup<T: 'static>(&self) -> Option<&KindDescriptor> {
        self.kinds.get(&TypeId::of::<T>())
    }

    /// Registered kinds ordered by apiVersion then kind.
    pub fn kinds(&self) -> Vec<&KindDescriptor> {
        let mut out: Vec<_> = self.kinds.values().collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        out
    }

    /// Serialize `obj` with `apiVersion` and `kind` filled from the registry.
    pub fn to_tagged_json<T: Serialize + 'static>(&self, obj: &T) -> Result<serde_json::Value> {
        let desc = self.lookup::<T>().ok_or_else(|| {
            Error::InvalidArgument(format!("missing apiVersion or kind and cannot assign it; {} is not registered", type_name::<T>()))
        })?;
        let mut v = serde_json::to_value(obj).map_err(|e| Error::InvalidArgument(format!("serializing {}: {}", type_name::<T>(), e)))?;
        let map = v
            .as_object_mut()
            .ok_or_else(|| Error::InvalidArgument(format!("{} does not serialize to an object", type_name::<T>())))?;
        map.insert("apiVersion".into(), serde_json::Value::String(desc.api_version()));
        map.insert("kind".into(), serde_json::Value::String(desc.kind.clone()));
        Ok(v)
    }
}
