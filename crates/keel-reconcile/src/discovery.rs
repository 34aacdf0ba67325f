//! Memoized capability discovery
//!
//! Answers "does the target cluster serve this GVK?" once per kind per
//! process. Optional integrations (cert-manager, service meshes, ...) are
//! gated on this, so an absent CRD skips its builders instead of failing
//! the whole pass.
//!
//! Entries never expire: the set of served kinds is assumed stable for
//! the controller's lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use keel_common::kube_utils::{api_version_of, pluralize_kind};
use keel_common::Result;

use crate::client::ClusterClient;

/// Shared cache of GVK support, safe for concurrent reconciles.
///
/// Each kind owns a `OnceCell`, so concurrent misses for one kind share a
/// single discovery call while lookups of other kinds never wait on it.
/// The map shard guard is only held long enough to clone the cell.
pub struct DiscoveryCache {
    client: Arc<dyn ClusterClient>,
    entries: DashMap<GroupVersionKind, Arc<OnceCell<Option<ApiResource>>>>,
}

impl DiscoveryCache {
    /// Create an empty cache backed by `client`
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            entries: DashMap::new(),
        }
    }

    /// Whether the cluster serves `gvk`.
    ///
    /// A `NotFound` from the API listing means the group/version is not
    /// served at all and yields `false`; any other error is returned and
    /// not cached.
    pub async fn is_gvk_supported(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.resolve(gvk).await?.is_some())
    }

    /// The `ApiResource` for `gvk`, or `None` when the cluster does not serve it
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<ApiResource>> {
        let cached = self.entries.get(gvk).map(|cell| cell.value().clone());
        let cell = cached
            .unwrap_or_else(|| self.entries.entry(gvk.clone()).or_default().value().clone());
        if let Some(entry) = cell.get() {
            return Ok(entry.clone());
        }

        // An error leaves the cell empty so the next lookup retries
        let resolved = cell
            .get_or_try_init(|| async {
                let resolved = self.lookup(gvk).await?;
                info!(
                    group = %gvk.group,
                    version = %gvk.version,
                    kind = %gvk.kind,
                    supported = resolved.is_some(),
                    "discovered GVK support"
                );
                Ok::<_, keel_common::Error>(resolved)
            })
            .await?;
        Ok(resolved.clone())
    }

    /// Number of kinds resolved so far
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Whether nothing has been resolved yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Result<Option<ApiResource>> {
        let group_version = api_version_of(gvk);
        let served = match self.client.list_api_resources(&group_version).await {
            Ok(served) => served,
            Err(e) if e.is_not_found() => {
                debug!(group_version = %group_version, "group/version not served");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let plural = pluralize_kind(&gvk.kind);
        let found = served
            .iter()
            .find(|r| r.name == plural)
            // Irregular plurals the heuristic misses
            .or_else(|| served.iter().find(|r| r.kind == gvk.kind));

        Ok(found.map(|r| ApiResource::from_gvk_with_plural(gvk, &r.name)))
    }
}
