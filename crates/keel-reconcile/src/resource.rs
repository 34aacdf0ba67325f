//! Resource identity and typed/dynamic conversion

use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use keel_common::kube_utils::gvk_of;
use keel_common::{Error, Result};

/// Identity of a resource within one cluster: (GVK, namespace, name).
///
/// The namespace is empty for cluster-scoped resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// Namespace, empty when cluster-scoped
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Create a key from its parts
    pub fn new(gvk: GroupVersionKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a statically typed kind, e.g. `ResourceKey::of_type::<ConfigMap>(ns, name)`
    pub fn of_type<K>(namespace: impl Into<String>, name: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        Self::new(gvk, namespace, name)
    }

    /// Derive the key of a dynamic object from its type and object metadata
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let gvk = gvk_of(obj)?;
        let name = obj.metadata.name.clone().ok_or_else(|| {
            Error::builder(&gvk.kind, "<unnamed>", "resource has no metadata.name")
        })?;
        Ok(Self::new(
            gvk,
            obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        ))
    }

    /// The "{namespace}.{name}" form used by the desired-state index
    pub fn index_key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.gvk.group.is_empty() {
            self.gvk.kind.clone()
        } else {
            format!("{}.{}", self.gvk.kind, self.gvk.group)
        };
        if self.namespace.is_empty() {
            write!(f, "{}/{}", kind, self.name)
        } else {
            write!(f, "{}/{}/{}", kind, self.namespace, self.name)
        }
    }
}

/// What the engine needs to know about the object that owns the managed resources
#[derive(Debug, Clone)]
pub struct OwnerInfo {
    /// Owner name, used for log context
    pub name: String,
    /// Reference used when publishing events
    pub object_ref: ObjectReference,
    /// Controller owner reference stamped onto managed resources.
    /// `None` when the owner has not been persisted yet (no uid).
    pub owner_reference: Option<OwnerReference>,
}

impl OwnerInfo {
    /// Collect owner information from a typed resource
    pub fn of<K>(owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            name: owner.name_any(),
            object_ref: owner.object_ref(&()),
            owner_reference: owner.controller_owner_ref(&()),
        }
    }

    /// The owner's uid, when known
    pub fn uid(&self) -> Option<&str> {
        self.owner_reference.as_ref().map(|r| r.uid.as_str())
    }
}

/// Convert a typed resource into a `DynamicObject`
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    let mut dynamic: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    dynamic.types = Some(TypeMeta {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
    });
    Ok(dynamic)
}

/// Convert a `DynamicObject` into a typed resource
pub fn from_dynamic<K>(obj: &DynamicObject) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}
