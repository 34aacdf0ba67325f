//! Reconciliation engine
//!
//! One pass over a builder list:
//! 1. resolve: build each skeleton, drop kinds the cluster does not serve,
//!    fetch the live object
//! 2. order: builders without dependencies first, then by ascending
//!    dependency count
//! 3. apply, strictly sequentially: delete disabled resources, defer the
//!    whole batch on a missing/unready dependency (or one written earlier
//!    in the same pass), create missing resources, write updates only when
//!    the object actually changed
//! 4. prune (see [`crate::prune`]) when the caller asks for it
//!
//! The engine never retries. A deferred pass returns a requeue delay, a
//! failed call returns the error and stops the pass.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use keel_common::events::{actions, reasons, EventPublisher};
use keel_common::kube_utils::ensure_owner_reference;
use keel_common::{ReconcilerConfig, Result};

use crate::builder::ResourceBuilder;
use crate::client::ClusterClient;
use crate::compare::Comparators;
use crate::discovery::DiscoveryCache;
use crate::resource::{OwnerInfo, ResourceKey};
use crate::status::ResourceStatus;

/// What the engine did to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Resource did not exist and was created
    Created,
    /// Resource drifted and was rewritten
    Updated,
    /// Builder was disabled and its resource deleted
    Deleted,
    /// Orphan removed by pruning
    Pruned,
}

impl OperationKind {
    fn reason(self) -> &'static str {
        match self {
            Self::Created => reasons::RESOURCE_CREATED,
            Self::Updated => reasons::RESOURCE_UPDATED,
            Self::Deleted => reasons::RESOURCE_DELETED,
            Self::Pruned => reasons::RESOURCE_PRUNED,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::Created => actions::CREATE,
            Self::Updated => actions::UPDATE,
            Self::Deleted => actions::DELETE,
            Self::Pruned => actions::PRUNE,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Pruned => "pruned",
        };
        f.write_str(s)
    }
}

/// A write the engine performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// The resource written
    pub key: ResourceKey,
    /// The kind of write
    pub kind: OperationKind,
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Status of every enabled resource applied in this pass
    pub statuses: Vec<ResourceStatus>,
    /// Set when the pass stopped early and should be retried after the delay
    pub requeue_after: Option<Duration>,
    /// Writes performed, in order
    pub operations: Vec<Operation>,
}

impl ReconcileOutcome {
    /// Whether the pass stopped at an unsatisfied dependency
    pub fn is_deferred(&self) -> bool {
        self.requeue_after.is_some()
    }

    /// Whether every reported resource is ready
    pub fn all_ready(&self) -> bool {
        self.statuses.iter().all(|s| s.ready)
    }
}

/// A builder resolved against the cluster, ready to apply
struct Planned<'a> {
    builder: &'a dyn ResourceBuilder,
    key: ResourceKey,
    desired: DynamicObject,
    api: ApiResource,
    live: Option<DynamicObject>,
    dependencies: Vec<ResourceKey>,
}

/// Drives live cluster state toward the state described by builders
pub struct Reconciler {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) discovery: Arc<DiscoveryCache>,
    pub(crate) events: Arc<dyn EventPublisher>,
    comparators: Comparators,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create an engine
    pub fn new(
        client: Arc<dyn ClusterClient>,
        discovery: Arc<DiscoveryCache>,
        events: Arc<dyn EventPublisher>,
        comparators: Comparators,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            discovery,
            events,
            comparators,
            config,
        }
    }

    /// The cluster client used for every call
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// The shared discovery cache
    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// The event publisher
    pub fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.events
    }

    /// Engine configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass for `owner` over `builders` (no pruning)
    pub async fn reconcile<K>(
        &self,
        owner: &K,
        builders: &[Box<dyn ResourceBuilder>],
    ) -> Result<ReconcileOutcome>
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        self.reconcile_for(&OwnerInfo::of(owner), builders).await
    }

    /// Run one pass, then prune resources that `known` factories can
    /// produce but `builders` no longer claim. Pruning is skipped when the
    /// pass was deferred.
    pub async fn reconcile_and_prune<K>(
        &self,
        owner: &K,
        builders: &[Box<dyn ResourceBuilder>],
        known: &[Box<dyn ResourceBuilder>],
    ) -> Result<ReconcileOutcome>
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        let owner = OwnerInfo::of(owner);
        let mut outcome = self.reconcile_for(&owner, builders).await?;
        if outcome.is_deferred() {
            return Ok(outcome);
        }

        let pruned = self.prune_for(&owner, builders, known).await?;
        outcome
            .operations
            .extend(pruned.into_iter().map(|key| Operation {
                key,
                kind: OperationKind::Pruned,
            }));
        Ok(outcome)
    }

    /// Run one pass for an already-described owner
    #[instrument(skip_all, fields(owner = %owner.name, builders = builders.len()))]
    pub async fn reconcile_for(
        &self,
        owner: &OwnerInfo,
        builders: &[Box<dyn ResourceBuilder>],
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let mut written = HashSet::new();

        let planned = self.resolve(builders).await?;
        let reporters: HashMap<ResourceKey, &dyn ResourceBuilder> = planned
            .iter()
            .map(|item| (item.key.clone(), item.builder))
            .collect();

        for item in planned {
            if !item.builder.enabled() {
                if item.live.is_some()
                    && self
                        .delete(owner, &item.api, &item.key, OperationKind::Deleted)
                        .await?
                {
                    outcome.operations.push(Operation {
                        key: item.key,
                        kind: OperationKind::Deleted,
                    });
                }
                continue;
            }

            if let Some(blocker) = self
                .first_unready_dependency(&item.dependencies, &written, &reporters)
                .await?
            {
                info!(
                    resource = %item.key,
                    dependency = %blocker,
                    requeue_secs = self.config.dependency_requeue.as_secs(),
                    "dependency not ready, deferring remaining builders"
                );
                outcome.requeue_after = Some(self.config.dependency_requeue);
                return Ok(outcome);
            }

            let builder = item.builder;
            let key = item.key.clone();
            let (live, operation) = self.apply(owner, item).await?;
            if let Some(kind) = operation {
                written.insert(key.clone());
                outcome.operations.push(Operation {
                    key: key.clone(),
                    kind,
                });
            }

            outcome.statuses.push(status_of(Some(builder), &key, &live));
        }

        debug!(
            writes = outcome.operations.len(),
            ready = outcome.all_ready(),
            "reconcile pass complete"
        );
        Ok(outcome)
    }

    /// Build every skeleton, drop unsupported kinds, fetch live objects and
    /// order the result.
    async fn resolve<'a>(
        &self,
        builders: &'a [Box<dyn ResourceBuilder>],
    ) -> Result<Vec<Planned<'a>>> {
        let mut planned = Vec::with_capacity(builders.len());
        for builder in builders {
            let desired = builder.build()?;
            let key = ResourceKey::of(&desired)?;
            let Some(api) = self.discovery.resolve(&key.gvk).await? else {
                debug!(resource = %key, "kind not served by cluster, skipping builder");
                continue;
            };
            let live = self.client.get(&api, &key.namespace, &key.name).await?;
            planned.push(Planned {
                builder: builder.as_ref(),
                dependencies: builder.dependencies(),
                key,
                desired,
                api,
                live,
            });
        }
        order_by_dependency_count(&mut planned);
        Ok(planned)
    }

    /// First dependency that is missing or not ready, if any.
    ///
    /// A dependency written earlier in the same pass is not ready: its
    /// controller has not observed the write yet. Readiness of a dependency
    /// planned in this pass comes from its own builder's reporter.
    async fn first_unready_dependency(
        &self,
        dependencies: &[ResourceKey],
        written: &HashSet<ResourceKey>,
        reporters: &HashMap<ResourceKey, &dyn ResourceBuilder>,
    ) -> Result<Option<ResourceKey>> {
        if let Some(dependency) = dependencies.iter().find(|d| written.contains(*d)) {
            return Ok(Some(dependency.clone()));
        }
        for dependency in dependencies {
            let Some(api) = self.discovery.resolve(&dependency.gvk).await? else {
                return Ok(Some(dependency.clone()));
            };
            match self
                .client
                .get(&api, &dependency.namespace, &dependency.name)
                .await?
            {
                Some(obj)
                    if status_of(reporters.get(dependency).copied(), dependency, &obj).ready => {}
                _ => return Ok(Some(dependency.clone())),
            }
        }
        Ok(None)
    }

    /// Fetch-or-build, mutate, diff-and-write.
    ///
    /// Returns the object as it now exists and the write performed, if any.
    async fn apply(
        &self,
        owner: &OwnerInfo,
        item: Planned<'_>,
    ) -> Result<(DynamicObject, Option<OperationKind>)> {
        let Planned {
            builder,
            key,
            desired,
            api,
            live,
            ..
        } = item;

        match live {
            None => {
                let mut obj = desired;
                builder.update(&mut obj)?;
                stamp_owner(owner, &mut obj);
                let result = self.client.create(&api, &obj).await;
                let created = self
                    .record(owner, &key, OperationKind::Created, result)
                    .await?;
                Ok((created, Some(OperationKind::Created)))
            }
            Some(live) => {
                let snapshot = live.clone();
                let mut obj = live;
                builder.update(&mut obj)?;
                stamp_owner(owner, &mut obj);

                let unchanged = match builder.comparator() {
                    Some(cmp) => cmp(&snapshot, &obj),
                    None => self.comparators.equal(&key.gvk, &snapshot, &obj),
                };
                if unchanged {
                    debug!(resource = %key, "up to date");
                    return Ok((snapshot, None));
                }

                let result = self.client.update(&api, &obj).await;
                let updated = self
                    .record(owner, &key, OperationKind::Updated, result)
                    .await?;
                Ok((updated, Some(OperationKind::Updated)))
            }
        }
    }

    /// Delete a resource. Returns `false` when it was already gone.
    pub(crate) async fn delete(
        &self,
        owner: &OwnerInfo,
        api: &ApiResource,
        key: &ResourceKey,
        kind: OperationKind,
    ) -> Result<bool> {
        match self.client.delete(api, &key.namespace, &key.name).await {
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "already deleted");
                Ok(false)
            }
            result => self.record(owner, key, kind, result).await.map(|_| true),
        }
    }

    /// Log and publish the outcome of a write, passing the result through
    async fn record<T>(
        &self,
        owner: &OwnerInfo,
        key: &ResourceKey,
        kind: OperationKind,
        result: Result<T>,
    ) -> Result<T> {
        match &result {
            Ok(_) => {
                info!(resource = %key, operation = %kind, "resource {}", kind);
                self.events
                    .publish(
                        &owner.object_ref,
                        EventType::Normal,
                        kind.reason(),
                        kind.action(),
                        Some(format!("{} {}", key, kind)),
                    )
                    .await;
            }
            Err(e) if e.is_conflict() => {
                // Someone else wrote first; the next pass re-reads and retries
                info!(
                    resource = %key,
                    operation = %kind,
                    "write conflicted with a concurrent change"
                );
            }
            Err(e) => {
                warn!(resource = %key, operation = %kind, error = %e, "write failed");
                self.events
                    .publish(
                        &owner.object_ref,
                        EventType::Warning,
                        reasons::RECONCILE_FAILED,
                        kind.action(),
                        Some(format!("{} {} failed: {}", kind.action(), key, e)),
                    )
                    .await;
            }
        }
        result
    }
}

/// Zero-dependency builders first, then ascending dependency count.
///
/// This is a count heuristic, not a topological sort: a dependency's own
/// dependencies are not guaranteed to run first, and cycles are not
/// detected (they simply defer forever). The sort is stable, so builders
/// with equal counts keep the caller's order.
fn order_by_dependency_count(planned: &mut [Planned<'_>]) {
    planned.sort_by_key(|p| p.dependencies.len());
}

/// Builder-reported readiness, falling back to the generic rollout predicate
fn status_of(
    builder: Option<&dyn ResourceBuilder>,
    key: &ResourceKey,
    live: &DynamicObject,
) -> ResourceStatus {
    builder
        .and_then(|b| b.report_status(live))
        .unwrap_or_else(|| ResourceStatus::observe(key, live))
}

fn stamp_owner(owner: &OwnerInfo, obj: &mut DynamicObject) {
    if let Some(owner_ref) = &owner.owner_reference {
        // Cluster-scoped objects cannot be owned by namespaced owners
        if obj.namespace().is_some() {
            ensure_owner_reference(&mut obj.metadata, owner_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};
    use kube::api::ObjectMeta;
    use serde_json::json;

    use keel_common::error::api_error;
    use keel_common::events::NoopEventPublisher;
    use keel_common::kube_utils::is_controlled_by;
    use keel_common::Error;

    use crate::builder::{Typed, TypedBuilder};
    use crate::client::{ApiResourceInfo, MockClusterClient};
    use crate::compare::Comparator;
    use crate::resource::to_dynamic;
    use crate::testing::{FakeCluster, FakeOp, RecordingEvents};

    const NS: &str = "prod";
    const OWNER_UID: &str = "owner-uid";

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        }
    }

    fn owner() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                uid: Some(OWNER_UID.to_string()),
                ..meta("shop")
            },
            ..Default::default()
        }
    }

    struct Settings {
        name: &'static str,
        value: &'static str,
        enabled: bool,
        after: Vec<&'static str>,
    }

    fn settings(name: &'static str) -> Settings {
        Settings {
            name,
            value: "on",
            enabled: true,
            after: Vec::new(),
        }
    }

    impl Settings {
        fn value(mut self, value: &'static str) -> Self {
            self.value = value;
            self
        }

        fn disabled(mut self) -> Self {
            self.enabled = false;
            self
        }

        fn after(mut self, dependency: &'static str) -> Self {
            self.after.push(dependency);
            self
        }

        fn boxed(self) -> Box<dyn ResourceBuilder> {
            Typed::boxed(self)
        }
    }

    impl TypedBuilder for Settings {
        type Kind = ConfigMap;

        fn build(&self) -> Result<ConfigMap> {
            Ok(ConfigMap {
                metadata: meta(self.name),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut ConfigMap) -> Result<()> {
            obj.data = Some(BTreeMap::from([(
                "value".to_string(),
                self.value.to_string(),
            )]));
            Ok(())
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn dependencies(&self) -> Vec<ResourceKey> {
            self.after
                .iter()
                .map(|name| ResourceKey::of_type::<ConfigMap>(NS, *name))
                .collect()
        }
    }

    struct Api;

    impl TypedBuilder for Api {
        type Kind = Deployment;

        fn build(&self) -> Result<Deployment> {
            Ok(Deployment {
                metadata: meta("api"),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut Deployment) -> Result<()> {
            obj.spec.get_or_insert_with(Default::default).replicas = Some(1);
            Ok(())
        }
    }

    struct Frontend {
        enabled: bool,
    }

    impl TypedBuilder for Frontend {
        type Kind = Service;

        fn build(&self) -> Result<Service> {
            Ok(Service {
                metadata: meta("frontend"),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut Service) -> Result<()> {
            obj.spec.get_or_insert_with(Default::default).selector =
                Some(BTreeMap::from([("app".to_string(), "api".to_string())]));
            Ok(())
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn dependencies(&self) -> Vec<ResourceKey> {
            vec![ResourceKey::of_type::<Deployment>(NS, "api")]
        }
    }

    struct Gateway {
        after: &'static str,
        enabled: bool,
    }

    impl TypedBuilder for Gateway {
        type Kind = Service;

        fn build(&self) -> Result<Service> {
            Ok(Service {
                metadata: meta("gateway"),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut Service) -> Result<()> {
            obj.spec.get_or_insert_with(Default::default).type_ = Some("ClusterIP".to_string());
            Ok(())
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn dependencies(&self) -> Vec<ResourceKey> {
            vec![ResourceKey::of_type::<ConfigMap>(NS, self.after)]
        }
    }

    /// Raw builder whose update always touches an annotation
    struct Stamped {
        passes: AtomicUsize,
        comparator: Option<Comparator>,
    }

    fn stamped(comparator: Option<Comparator>) -> Box<dyn ResourceBuilder> {
        Box::new(Stamped {
            passes: AtomicUsize::new(0),
            comparator,
        })
    }

    fn same_data() -> Comparator {
        Arc::new(|a: &DynamicObject, b: &DynamicObject| a.data == b.data)
    }

    impl ResourceBuilder for Stamped {
        fn build(&self) -> Result<DynamicObject> {
            to_dynamic(&ConfigMap {
                metadata: meta("stamped"),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut DynamicObject) -> Result<()> {
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            obj.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert("keel.dev/pass".to_string(), pass.to_string());
            obj.data["data"] = json!({ "value": "on" });
            Ok(())
        }

        fn comparator(&self) -> Option<Comparator> {
            self.comparator.clone()
        }
    }

    /// Deployment builder that declares itself ready as soon as it exists
    struct SelfReportingApi;

    impl ResourceBuilder for SelfReportingApi {
        fn build(&self) -> Result<DynamicObject> {
            to_dynamic(&Deployment {
                metadata: meta("api"),
                ..Default::default()
            })
        }

        fn update(&self, obj: &mut DynamicObject) -> Result<()> {
            obj.data["spec"] = json!({ "replicas": 1 });
            Ok(())
        }

        fn report_status(&self, live: &DynamicObject) -> Option<ResourceStatus> {
            let key = ResourceKey::of(live).ok()?;
            Some(ResourceStatus::with_readiness(&key, live, true))
        }
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingEvents>,
        engine: Reconciler,
    }

    fn harness_with(cluster: FakeCluster) -> Harness {
        harness_with_comparators(cluster, Comparators::new())
    }

    fn harness_with_comparators(cluster: FakeCluster, comparators: Comparators) -> Harness {
        let cluster = Arc::new(cluster);
        let events = Arc::new(RecordingEvents::new());
        let client: Arc<dyn ClusterClient> = cluster.clone();
        let engine = Reconciler::new(
            client.clone(),
            Arc::new(DiscoveryCache::new(client)),
            events.clone(),
            comparators,
            ReconcilerConfig::default(),
        );
        Harness {
            cluster,
            events,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeCluster::with_builtin_kinds())
    }

    fn config_map_key(name: &str) -> ResourceKey {
        ResourceKey::of_type::<ConfigMap>(NS, name)
    }

    fn op(name: &str, kind: OperationKind) -> (String, OperationKind) {
        (name.to_string(), kind)
    }

    fn ops(outcome: &ReconcileOutcome) -> Vec<(String, OperationKind)> {
        outcome
            .operations
            .iter()
            .map(|o| (o.key.name.clone(), o.kind))
            .collect()
    }

    // =========================================================================
    // Create / update / idempotence
    // =========================================================================

    #[tokio::test]
    async fn first_pass_creates_and_second_pass_writes_nothing() {
        let h = harness();
        let builders = vec![settings("settings").boxed(), Typed::boxed(Api)];

        let first = h.engine.reconcile(&owner(), &builders).await.unwrap();
        assert_eq!(
            ops(&first),
            vec![
                op("settings", OperationKind::Created),
                op("api", OperationKind::Created)
            ]
        );
        assert_eq!(first.statuses.len(), 2);
        assert!(!first.is_deferred());

        let stored = h.cluster.object(&config_map_key("settings")).unwrap();
        assert_eq!(stored.data["data"]["value"], "on");
        assert!(is_controlled_by(&stored.metadata, OWNER_UID));

        h.cluster.reset_calls();
        let second = h.engine.reconcile(&owner(), &builders).await.unwrap();
        assert!(second.operations.is_empty());
        assert_eq!(h.cluster.calls().writes(), 0);
        assert_eq!(
            h.events.reasons(),
            vec![reasons::RESOURCE_CREATED, reasons::RESOURCE_CREATED]
        );
    }

    #[tokio::test]
    async fn drift_is_corrected_with_a_single_update() {
        let h = harness();
        h.engine
            .reconcile(&owner(), &[settings("settings").boxed()])
            .await
            .unwrap();

        h.cluster.reset_calls();
        let outcome = h
            .engine
            .reconcile(&owner(), &[settings("settings").value("off").boxed()])
            .await
            .unwrap();

        assert_eq!(ops(&outcome), vec![op("settings", OperationKind::Updated)]);
        assert_eq!(h.cluster.calls().updates, 1);
        let stored = h.cluster.object(&config_map_key("settings")).unwrap();
        assert_eq!(stored.data["data"]["value"], "off");
    }

    #[tokio::test]
    async fn existing_unowned_object_is_adopted() {
        let h = harness();
        h.cluster.insert(
            to_dynamic(&ConfigMap {
                metadata: meta("settings"),
                data: Some(BTreeMap::from([("value".to_string(), "on".to_string())])),
                ..Default::default()
            })
            .unwrap(),
        );

        let outcome = h
            .engine
            .reconcile(&owner(), &[settings("settings").boxed()])
            .await
            .unwrap();

        assert_eq!(ops(&outcome), vec![op("settings", OperationKind::Updated)]);
        let stored = h.cluster.object(&config_map_key("settings")).unwrap();
        assert!(is_controlled_by(&stored.metadata, OWNER_UID));
    }

    #[tokio::test]
    async fn builder_comparator_suppresses_cosmetic_updates() {
        let h = harness();
        let builders = vec![stamped(Some(same_data()))];

        h.engine.reconcile(&owner(), &builders).await.unwrap();
        h.cluster.reset_calls();
        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert!(outcome.operations.is_empty());
        assert_eq!(h.cluster.calls().writes(), 0);
    }

    #[tokio::test]
    async fn structural_comparison_writes_any_change() {
        let h = harness();
        let builders = vec![stamped(None)];

        h.engine.reconcile(&owner(), &builders).await.unwrap();
        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert_eq!(ops(&outcome), vec![op("stamped", OperationKind::Updated)]);
    }

    #[tokio::test]
    async fn registered_kind_comparator_suppresses_cosmetic_updates() {
        let gvk = ResourceKey::of_type::<ConfigMap>(NS, "stamped").gvk;
        let h = harness_with_comparators(
            FakeCluster::with_builtin_kinds(),
            Comparators::new().with(gvk, same_data()),
        );
        let builders = vec![stamped(None)];

        h.engine.reconcile(&owner(), &builders).await.unwrap();
        h.cluster.reset_calls();
        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert!(outcome.operations.is_empty());
        assert_eq!(h.cluster.calls().writes(), 0);
    }

    #[tokio::test]
    async fn builder_comparator_takes_precedence_over_registered_one() {
        let gvk = ResourceKey::of_type::<ConfigMap>(NS, "stamped").gvk;
        let always_equal: Comparator = Arc::new(|_: &DynamicObject, _: &DynamicObject| true);
        let h = harness_with_comparators(
            FakeCluster::with_builtin_kinds(),
            Comparators::new().with(gvk, always_equal),
        );
        let same_annotations: Comparator = Arc::new(|a: &DynamicObject, b: &DynamicObject| {
            a.metadata.annotations == b.metadata.annotations
        });
        let builders = vec![stamped(Some(same_annotations))];

        h.engine.reconcile(&owner(), &builders).await.unwrap();
        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert_eq!(ops(&outcome), vec![op("stamped", OperationKind::Updated)]);
    }

    // =========================================================================
    // Dependencies and ordering
    // =========================================================================

    #[tokio::test]
    async fn dependent_waits_for_dependency_rollout_then_is_removed_when_disabled() {
        let h = harness();
        let deployment_key = ResourceKey::of_type::<Deployment>(NS, "api");
        let service_key = ResourceKey::of_type::<Service>(NS, "frontend");
        let builders = |frontend: bool| {
            vec![
                Typed::boxed(Frontend { enabled: frontend }),
                Typed::boxed(Api),
            ]
        };

        let first = h.engine.reconcile(&owner(), &builders(true)).await.unwrap();
        assert_eq!(first.requeue_after, Some(Duration::from_secs(5)));
        assert_eq!(ops(&first), vec![op("api", OperationKind::Created)]);
        assert!(!first.all_ready());
        assert!(!h.cluster.contains(&service_key));

        h.cluster.set_status(
            &deployment_key,
            json!({
                "observedGeneration": 1,
                "replicas": 1,
                "readyReplicas": 1,
                "updatedReplicas": 1,
                "availableReplicas": 1
            }),
        );

        let second = h.engine.reconcile(&owner(), &builders(true)).await.unwrap();
        assert!(!second.is_deferred());
        assert_eq!(ops(&second), vec![op("frontend", OperationKind::Created)]);
        assert_eq!(second.statuses.len(), 2);
        assert!(second.all_ready());

        let third = h.engine.reconcile(&owner(), &builders(false)).await.unwrap();
        assert_eq!(ops(&third), vec![op("frontend", OperationKind::Deleted)]);
        assert!(!h.cluster.contains(&service_key));
        assert_eq!(third.statuses.len(), 1);
        assert_eq!(third.statuses[0].name, "api");
    }

    #[tokio::test]
    async fn dependency_readiness_comes_from_its_builder_reporter() {
        let h = harness();
        let builders = || {
            vec![
                Typed::boxed(Frontend { enabled: true }),
                Box::new(SelfReportingApi) as Box<dyn ResourceBuilder>,
            ]
        };

        let first = h.engine.reconcile(&owner(), &builders()).await.unwrap();
        assert!(first.is_deferred());
        assert_eq!(ops(&first), vec![op("api", OperationKind::Created)]);

        // No rollout status yet, but the builder reports the Deployment ready
        let second = h.engine.reconcile(&owner(), &builders()).await.unwrap();
        assert!(!second.is_deferred());
        assert_eq!(ops(&second), vec![op("frontend", OperationKind::Created)]);
        assert!(second.statuses.iter().all(|s| s.ready));
    }

    #[tokio::test]
    async fn missing_dependency_defers_the_rest_of_the_batch() {
        let h = harness();
        let builders = vec![
            settings("consumer").after("upstream").boxed(),
            settings("bystander").after("upstream").boxed(),
        ];

        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(5)));
        assert!(outcome.statuses.is_empty());
        assert_eq!(h.cluster.calls().writes(), 0);
    }

    #[tokio::test]
    async fn dependency_created_in_the_same_pass_defers_its_dependent() {
        let h = harness();
        let builders = |enabled: bool| {
            vec![
                settings("settings").boxed(),
                Typed::boxed(Gateway {
                    after: "settings",
                    enabled,
                }),
            ]
        };

        let first = h.engine.reconcile(&owner(), &builders(true)).await.unwrap();
        assert_eq!(first.requeue_after, Some(Duration::from_secs(5)));
        assert_eq!(ops(&first), vec![op("settings", OperationKind::Created)]);

        let second = h.engine.reconcile(&owner(), &builders(true)).await.unwrap();
        assert!(!second.is_deferred());
        assert_eq!(ops(&second), vec![op("gateway", OperationKind::Created)]);

        let third = h.engine.reconcile(&owner(), &builders(false)).await.unwrap();
        assert_eq!(ops(&third), vec![op("gateway", OperationKind::Deleted)]);
        assert!(h.cluster.contains(&config_map_key("settings")));
        assert!(!h
            .cluster
            .contains(&ResourceKey::of_type::<Service>(NS, "gateway")));
    }

    #[tokio::test]
    async fn equal_dependency_counts_keep_caller_order() {
        let h = harness();
        h.cluster.insert(
            to_dynamic(&ConfigMap {
                metadata: meta("w"),
                ..Default::default()
            })
            .unwrap(),
        );
        let builders = vec![
            settings("x").after("w").boxed(),
            settings("z").boxed(),
            settings("y").boxed(),
        ];

        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert_eq!(
            ops(&outcome),
            vec![
                op("z", OperationKind::Created),
                op("y", OperationKind::Created),
                op("x", OperationKind::Created)
            ]
        );
    }

    #[tokio::test]
    async fn ordering_counts_dependencies_rather_than_sorting_transitively() {
        // "a" needs only "b", so it sorts ahead of "b" (two dependencies)
        // and keeps deferring the batch before "b" is ever reached.
        let h = harness();
        let builders = || {
            vec![
                settings("a").after("b").boxed(),
                settings("b").after("c").after("d").boxed(),
                settings("c").boxed(),
                settings("d").boxed(),
            ]
        };

        for _ in 0..2 {
            let outcome = h.engine.reconcile(&owner(), &builders()).await.unwrap();
            assert!(outcome.is_deferred());
        }

        assert!(h.cluster.contains(&config_map_key("c")));
        assert!(h.cluster.contains(&config_map_key("d")));
        assert!(!h.cluster.contains(&config_map_key("b")));
        assert!(!h.cluster.contains(&config_map_key("a")));
    }

    #[tokio::test]
    async fn dependency_cycle_defers_without_error() {
        let h = harness();
        let builders = vec![
            settings("left").after("right").boxed(),
            settings("right").after("left").boxed(),
        ];

        let outcome = h.engine.reconcile(&owner(), &builders).await.unwrap();

        assert!(outcome.is_deferred());
        assert_eq!(h.cluster.calls().writes(), 0);
    }

    // =========================================================================
    // Discovery, deletion and failures
    // =========================================================================

    #[tokio::test]
    async fn builders_for_unserved_kinds_are_skipped() {
        let cluster = FakeCluster::new();
        cluster.serve("v1", "ConfigMap", "configmaps");
        let h = harness_with(cluster);

        let outcome = h
            .engine
            .reconcile(&owner(), &[settings("settings").boxed(), Typed::boxed(Api)])
            .await
            .unwrap();

        assert_eq!(ops(&outcome), vec![op("settings", OperationKind::Created)]);
        assert_eq!(outcome.statuses.len(), 1);
        assert!(!h
            .cluster
            .contains(&ResourceKey::of_type::<Deployment>(NS, "api")));
    }

    #[tokio::test]
    async fn disabled_builder_without_live_object_does_nothing() {
        let h = harness();

        let outcome = h
            .engine
            .reconcile(&owner(), &[settings("settings").disabled().boxed()])
            .await
            .unwrap();

        assert!(outcome.operations.is_empty());
        assert!(outcome.statuses.is_empty());
        assert_eq!(h.cluster.calls().deletes, 0);
    }

    #[tokio::test]
    async fn delete_of_vanished_resource_is_not_an_error() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_api_resources().returning(|_| {
            Ok(vec![ApiResourceInfo {
                name: "configmaps".to_string(),
                kind: "ConfigMap".to_string(),
                namespaced: true,
            }])
        });
        let live = to_dynamic(&ConfigMap {
            metadata: meta("settings"),
            ..Default::default()
        })
        .unwrap();
        mock.expect_get()
            .returning(move |_, _, _| Ok(Some(live.clone())));
        mock.expect_delete()
            .times(1)
            .returning(|_, _, _| Err(api_error(404, "NotFound", "configmaps \"settings\" not found")));
        mock.expect_create().never();
        mock.expect_update().never();

        let client: Arc<dyn ClusterClient> = Arc::new(mock);
        let engine = Reconciler::new(
            client.clone(),
            Arc::new(DiscoveryCache::new(client)),
            Arc::new(NoopEventPublisher),
            Comparators::new(),
            ReconcilerConfig::default(),
        );

        let outcome = engine
            .reconcile(&owner(), &[settings("settings").disabled().boxed()])
            .await
            .unwrap();
        assert!(outcome.operations.is_empty());
    }

    #[tokio::test]
    async fn first_failed_write_stops_the_pass() {
        let h = harness();
        h.cluster.fail_on(FakeOp::Create, "first", 500);

        let err = h
            .engine
            .reconcile(
                &owner(),
                &[settings("first").boxed(), settings("second").boxed()],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Kube { .. }));
        assert!(!h.cluster.contains(&config_map_key("second")));
        let events = h.events.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].reason, reasons::RECONCILE_FAILED);
        assert_eq!(events[0].object, "shop");
    }

    #[tokio::test]
    async fn conflicting_update_is_retryable_and_publishes_no_warning() {
        let h = harness();
        h.engine
            .reconcile(&owner(), &[settings("settings").boxed()])
            .await
            .unwrap();
        h.cluster.fail_on(FakeOp::Update, "settings", 409);

        let err = h
            .engine
            .reconcile(&owner(), &[settings("settings").value("off").boxed()])
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(h.events.reasons(), vec![reasons::RESOURCE_CREATED]);
    }

    #[tokio::test]
    async fn failed_lookup_stops_before_any_write() {
        let h = harness();
        h.cluster.fail_on(FakeOp::Get, "second", 503);

        let err = h
            .engine
            .reconcile(
                &owner(),
                &[settings("first").boxed(), settings("second").boxed()],
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.cluster.calls().writes(), 0);
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    #[tokio::test]
    async fn orphan_is_pruned_once_and_not_recreated() {
        let h = harness();
        let known = || vec![settings("settings").boxed(), settings("extra").boxed()];

        h.engine
            .reconcile_and_prune(&owner(), &known(), &known())
            .await
            .unwrap();
        assert!(h.cluster.contains(&config_map_key("extra")));

        let active = vec![settings("settings").boxed()];
        let second = h
            .engine
            .reconcile_and_prune(&owner(), &active, &known())
            .await
            .unwrap();
        assert_eq!(ops(&second), vec![op("extra", OperationKind::Pruned)]);
        assert!(!h.cluster.contains(&config_map_key("extra")));
        assert!(h
            .events
            .reasons()
            .contains(&reasons::RESOURCE_PRUNED.to_string()));

        h.cluster.reset_calls();
        let third = h
            .engine
            .reconcile_and_prune(&owner(), &active, &known())
            .await
            .unwrap();
        assert!(third.operations.is_empty());
        assert_eq!(h.cluster.calls().writes(), 0);
        assert!(!h.cluster.contains(&config_map_key("extra")));
    }

    #[tokio::test]
    async fn pruning_leaves_objects_the_owner_does_not_control() {
        let h = harness();
        h.cluster.insert(
            to_dynamic(&ConfigMap {
                metadata: meta("extra"),
                ..Default::default()
            })
            .unwrap(),
        );

        let outcome = h
            .engine
            .reconcile_and_prune(
                &owner(),
                &[settings("settings").boxed()],
                &[settings("settings").boxed(), settings("extra").boxed()],
            )
            .await
            .unwrap();

        assert_eq!(ops(&outcome), vec![op("settings", OperationKind::Created)]);
        assert!(h.cluster.contains(&config_map_key("extra")));
    }

    #[tokio::test]
    async fn deferred_pass_does_not_prune() {
        let h = harness();
        let known = || vec![settings("settings").boxed(), settings("extra").boxed()];
        h.engine.reconcile(&owner(), &known()).await.unwrap();

        let outcome = h
            .engine
            .reconcile_and_prune(
                &owner(),
                &[settings("late").after("never").boxed()],
                &known(),
            )
            .await
            .unwrap();

        assert!(outcome.is_deferred());
        assert!(h.cluster.contains(&config_map_key("extra")));
        assert!(h.cluster.contains(&config_map_key("settings")));
    }

    #[tokio::test]
    async fn disabled_builder_is_deleted_not_pruned() {
        let h = harness();
        let known = || vec![settings("settings").boxed()];
        h.engine.reconcile(&owner(), &known()).await.unwrap();

        let outcome = h
            .engine
            .reconcile_and_prune(&owner(), &[settings("settings").disabled().boxed()], &known())
            .await
            .unwrap();

        assert_eq!(ops(&outcome), vec![op("settings", OperationKind::Deleted)]);
    }
}
