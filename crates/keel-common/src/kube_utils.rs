//! Shared Kubernetes helpers for dynamic resources
//!
//! The engine works exclusively on `DynamicObject`s, so identity, condition
//! and owner-reference handling all operate on the untyped representation.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::ApiResource;

use crate::Error;

/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Parse an apiVersion string into (group, version)
///
/// ```
/// use keel_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Render the apiVersion string of a GVK (`v1` for the core group)
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Irregular plurals that the suffix rules below get wrong
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("ingressclass", "ingressclasses"),
    ("storageclass", "storageclasses"),
    ("priorityclass", "priorityclasses"),
    ("runtimeclass", "runtimeclasses"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known irregular kinds, falling back to simple
/// English pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x')
    {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource for a GVK using the heuristic plural
pub fn api_resource_for(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(gvk, &pluralize_kind(&gvk.kind))
}

/// Extract the GVK from a dynamic object's type metadata
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, Error> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::serialization(format!(
            "object {} has no apiVersion/kind",
            obj.metadata.name.as_deref().unwrap_or_default()
        ))
    })?;
    Ok(gvk_from_type_meta(types))
}

/// Convert `TypeMeta` into a GVK
pub fn gvk_from_type_meta(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = parse_api_version(&types.api_version);
    GroupVersionKind::gvk(&group, &version, &types.kind)
}

/// Check whether a JSON `status.conditions` array holds a condition of the
/// given type, returning its status string.
pub fn condition_status<'a>(obj: &'a serde_json::Value, condition_type: &str) -> Option<&'a str> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
}

/// Check if a condition of the given type has status "True"
pub fn has_condition(obj: &serde_json::Value, condition_type: &str) -> bool {
    condition_status(obj, condition_type) == Some(STATUS_TRUE)
}

/// Whether the object carries a controller owner reference with the given uid
pub fn is_controlled_by(meta: &kube::api::ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.uid == owner_uid && r.controller == Some(true))
        })
        .unwrap_or(false)
}

/// Add a controller owner reference unless one for the same owner already exists.
///
/// Returns `true` when the metadata was changed.
pub fn ensure_owner_reference(meta: &mut kube::api::ObjectMeta, owner: &OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r.uid == owner.uid) {
        return false;
    }
    refs.push(owner.clone());
    true
}
