//! Equality used to decide whether an update must be written
//!
//! The default is structural equality of the whole object. Kinds whose
//! server-side representation differs harmlessly from the builder's output
//! get a custom comparator, registered per GVK when the engine is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;

/// Returns `true` when the two objects are equal for update purposes.
///
/// Called as `comparator(snapshot, mutated)`.
pub type Comparator = Arc<dyn Fn(&DynamicObject, &DynamicObject) -> bool + Send + Sync>;

/// Per-kind comparator map, fixed at engine construction
#[derive(Clone, Default)]
pub struct Comparators {
    by_kind: HashMap<GroupVersionKind, Comparator>,
}

impl Comparators {
    /// An empty map: every kind uses structural equality
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a comparator for a kind, replacing any previous one
    pub fn with(mut self, gvk: GroupVersionKind, comparator: Comparator) -> Self {
        self.by_kind.insert(gvk, comparator);
        self
    }

    /// Compare using the registered comparator for `gvk`, or structurally
    pub fn equal(&self, gvk: &GroupVersionKind, a: &DynamicObject, b: &DynamicObject) -> bool {
        match self.by_kind.get(gvk) {
            Some(cmp) => cmp(a, b),
            None => structurally_equal(a, b),
        }
    }
}

impl fmt::Debug for Comparators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparators")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Structural equality of type, metadata and body
pub fn structurally_equal(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.types == b.types && a.metadata == b.metadata && a.data == b.data
}

/// Comparator that ignores `status` and server-managed metadata
/// (resourceVersion, managedFields, generation).
///
/// Suited to kinds whose status is rewritten by their own controller
/// between the read and the diff.
pub fn ignoring_status() -> Comparator {
    Arc::new(|a: &DynamicObject, b: &DynamicObject| normalized(a) == normalized(b))
}

fn normalized(obj: &DynamicObject) -> (serde_json::Value, serde_json::Value) {
    let mut meta = obj.metadata.clone();
    meta.resource_version = None;
    meta.managed_fields = None;
    meta.generation = None;
    let meta = serde_json::to_value(meta).unwrap_or_default();

    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    (meta, data)
}
