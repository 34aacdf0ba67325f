//! Resource builders
//!
//! A builder owns the desired shape of exactly one resource. It is
//! constructed fresh for every reconcile pass and has no identity beyond
//! the resource it builds.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use keel_common::Result;

use crate::compare::Comparator;
use crate::resource::{from_dynamic, to_dynamic, ResourceKey};
use crate::status::ResourceStatus;

/// Produces one resource and brings a live copy of it to its desired form.
pub trait ResourceBuilder: Send + Sync {
    /// Skeleton of the resource. Must carry apiVersion, kind, name and,
    /// for namespaced kinds, namespace.
    fn build(&self) -> Result<DynamicObject>;

    /// Mutate `obj` (the skeleton on create, the live object on update)
    /// into its desired form. Must be idempotent.
    fn update(&self, obj: &mut DynamicObject) -> Result<()>;

    /// A disabled builder's resource is deleted if it exists
    fn enabled(&self) -> bool {
        true
    }

    /// Resources that must exist and be ready before this one is written
    fn dependencies(&self) -> Vec<ResourceKey> {
        Vec::new()
    }

    /// Equality used to skip no-op updates, overriding the engine's
    /// per-kind comparators
    fn comparator(&self) -> Option<Comparator> {
        None
    }

    /// Readiness of the live resource. `None` falls back to the generic
    /// rollout predicate.
    fn report_status(&self, _live: &DynamicObject) -> Option<ResourceStatus> {
        None
    }
}

/// Builder written against a concrete `k8s-openapi` (or CRD) type.
///
/// Wrap in [`Typed`] to hand it to the engine.
pub trait TypedBuilder: Send + Sync {
    /// The resource type produced
    type Kind: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Skeleton of the resource
    fn build(&self) -> Result<Self::Kind>;

    /// Bring `obj` to its desired form
    fn update(&self, obj: &mut Self::Kind) -> Result<()>;

    /// See [`ResourceBuilder::enabled`]
    fn enabled(&self) -> bool {
        true
    }

    /// See [`ResourceBuilder::dependencies`]
    fn dependencies(&self) -> Vec<ResourceKey> {
        Vec::new()
    }

    /// See [`ResourceBuilder::report_status`]
    fn report_status(&self, _live: &Self::Kind) -> Option<ResourceStatus> {
        None
    }
}

/// Adapter erasing a [`TypedBuilder`] into a [`ResourceBuilder`]
pub struct Typed<B>(pub B);

impl<B: TypedBuilder> Typed<B> {
    /// Box the adapter for use in a builder list
    pub fn boxed(builder: B) -> Box<dyn ResourceBuilder>
    where
        B: 'static,
    {
        Box::new(Typed(builder))
    }
}

impl<B: TypedBuilder> ResourceBuilder for Typed<B> {
    fn build(&self) -> Result<DynamicObject> {
        to_dynamic(&self.0.build()?)
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<()> {
        let before: B::Kind = from_dynamic(obj)?;
        let mut after = before.clone();
        self.0.update(&mut after)?;

        // Only write back on a real change: the typed round trip drops
        // fields the type does not model, which would otherwise show up as
        // a diff on every pass.
        if serde_json::to_value(&before)? != serde_json::to_value(&after)? {
            let mut updated = to_dynamic(&after)?;
            updated.metadata.resource_version = obj.metadata.resource_version.clone();
            *obj = updated;
        }
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.0.enabled()
    }

    fn dependencies(&self) -> Vec<ResourceKey> {
        self.0.dependencies()
    }

    fn report_status(&self, live: &DynamicObject) -> Option<ResourceStatus> {
        let typed: B::Kind = from_dynamic(live).ok()?;
        self.0.report_status(&typed)
    }
}

impl<T: ResourceBuilder + ?Sized> ResourceBuilder for Arc<T> {
    fn build(&self) -> Result<DynamicObject> {
        (**self).build()
    }

    fn update(&self, obj: &mut DynamicObject) -> Result<()> {
        (**self).update(obj)
    }

    fn enabled(&self) -> bool {
        (**self).enabled()
    }

    fn dependencies(&self) -> Vec<ResourceKey> {
        (**self).dependencies()
    }

    fn comparator(&self) -> Option<Comparator> {
        (**self).comparator()
    }

    fn report_status(&self, live: &DynamicObject) -> Option<ResourceStatus> {
        (**self).report_status(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    struct Settings {
        enabled: bool,
    }

    impl TypedBuilder for Settings {
        type Kind = ConfigMap;

        fn build(&self) -> Result<ConfigMap> {
            Ok(ConfigMap {
                metadata: ObjectMeta {
                    name: Some("settings".to_string()),
                    namespace: Some("prod".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut ConfigMap) -> Result<()> {
            obj.data = Some(BTreeMap::from([("mode".to_string(), "fast".to_string())]));
            Ok(())
        }

        fn enabled(&self) -> bool {
            self.enabled
        }
    }

    #[test]
    fn typed_build_produces_dynamic_skeleton() {
        let builder = Typed(Settings { enabled: true });
        let obj = builder.build().unwrap();
        assert_eq!(
            ResourceKey::of(&obj).unwrap(),
            ResourceKey::of_type::<ConfigMap>("prod", "settings")
        );
        assert!(builder.enabled());
        assert!(!Typed(Settings { enabled: false }).enabled());
    }

    #[test]
    fn typed_update_applies_change() {
        let builder = Typed(Settings { enabled: true });
        let mut obj = builder.build().unwrap();
        obj.metadata.resource_version = Some("3".to_string());
        builder.update(&mut obj).unwrap();
        assert_eq!(obj.data["data"]["mode"], "fast");
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("3"));
    }

    #[test]
    fn typed_update_without_change_leaves_object_untouched() {
        let builder = Typed(Settings { enabled: true });
        let mut obj = builder.build().unwrap();
        builder.update(&mut obj).unwrap();
        // Field the ConfigMap type does not model
        obj.data["x-extension"] = serde_json::json!("kept");
        let snapshot = obj.clone();

        builder.update(&mut obj).unwrap();
        assert_eq!(obj.data, snapshot.data);
        assert_eq!(obj.metadata, snapshot.metadata);
    }
}
