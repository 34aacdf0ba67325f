//! Orphan pruning
//!
//! `known` is every builder factory the caller could ever produce for an
//! owner (typically one builder per optional component, built from the
//! owner's identity alone). Anything a known factory names that the active
//! builder list does not claim is an orphan: it is deleted when it exists
//! and is controlled by the owner.

use kube::Resource;
use tracing::{debug, instrument};

use keel_common::kube_utils::is_controlled_by;
use keel_common::Result;

use crate::builder::ResourceBuilder;
use crate::engine::{OperationKind, Reconciler};
use crate::index::DesiredStateIndex;
use crate::resource::{OwnerInfo, ResourceKey};

impl Reconciler {
    /// Delete resources named by `known` that `active` no longer claims.
    ///
    /// Returns the keys that were deleted.
    pub async fn prune<K>(
        &self,
        owner: &K,
        active: &[Box<dyn ResourceBuilder>],
        known: &[Box<dyn ResourceBuilder>],
    ) -> Result<Vec<ResourceKey>>
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        self.prune_for(&OwnerInfo::of(owner), active, known).await
    }

    /// [`Reconciler::prune`] for an already-described owner
    #[instrument(skip_all, fields(owner = %owner.name, known = known.len()))]
    pub async fn prune_for(
        &self,
        owner: &OwnerInfo,
        active: &[Box<dyn ResourceBuilder>],
        known: &[Box<dyn ResourceBuilder>],
    ) -> Result<Vec<ResourceKey>> {
        let desired = DesiredStateIndex::from_builders(active)?;
        let mut pruned = Vec::new();

        for factory in known {
            let key = ResourceKey::of(&factory.build()?)?;
            let Some(api) = self.discovery.resolve(&key.gvk).await? else {
                continue;
            };
            if desired.has(&key) {
                continue;
            }
            let Some(live) = self.client.get(&api, &key.namespace, &key.name).await? else {
                continue;
            };
            if let Some(uid) = owner.uid() {
                if !is_controlled_by(&live.metadata, uid) {
                    debug!(resource = %key, "orphan candidate not controlled by owner, leaving it");
                    continue;
                }
            }
            if self.delete(owner, &api, &key, OperationKind::Pruned).await? {
                pruned.push(key);
            }
        }

        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned orphaned resources");
        }
        Ok(pruned)
    }
}
