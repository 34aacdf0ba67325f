//! In-memory cluster for tests
//!
//! [`FakeCluster`] implements [`ClusterClient`] over a map of objects with
//! enough API-server behavior to exercise the engine end to end: uids,
//! resourceVersion conflicts, generation bumps on spec changes, status
//! preserved across replaces, and discovery of a configurable set of kinds.
//! Every call is counted so tests can assert on write traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use serde_json::Value;

use keel_common::error::api_error;
use keel_common::events::EventPublisher;
use keel_common::kube_utils::{api_version_of, parse_api_version};
use keel_common::Error;

use crate::client::{ApiResourceInfo, ClusterClient};
use crate::resource::ResourceKey;

/// A cluster call, for call counting and injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `get`
    Get,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// Number of calls of each kind since the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `get` calls
    pub gets: usize,
    /// `create` calls
    pub creates: usize,
    /// `update` calls
    pub updates: usize,
    /// `delete` calls
    pub deletes: usize,
    /// `list_api_resources` calls
    pub discoveries: usize,
}

impl CallCounts {
    /// Creates, updates and deletes
    pub fn writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKey, DynamicObject>,
    served: BTreeMap<String, Vec<ApiResourceInfo>>,
    failures: HashMap<(FakeOp, String), u16>,
    calls: CallCounts,
    next_uid: u64,
    next_version: u64,
}

impl State {
    fn next_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }

    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn injected_failure(&self, op: FakeOp, name: &str) -> Option<Error> {
        self.failures
            .get(&(op, name.to_string()))
            .map(|code| api_error(*code, "Injected", format!("injected failure on {:?} {}", op, name)))
    }
}

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// A cluster that serves nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster serving the built-in kinds keel manages:
    /// ConfigMap, Secret, Service, Deployment, StatefulSet and Job
    pub fn with_builtin_kinds() -> Self {
        let cluster = Self::new();
        cluster.serve("v1", "ConfigMap", "configmaps");
        cluster.serve("v1", "Secret", "secrets");
        cluster.serve("v1", "Service", "services");
        cluster.serve("apps/v1", "Deployment", "deployments");
        cluster.serve("apps/v1", "StatefulSet", "statefulsets");
        cluster.serve("batch/v1", "Job", "jobs");
        cluster
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster state poisoned")
    }

    /// Serve a namespaced kind under `api_version`
    pub fn serve(&self, api_version: &str, kind: &str, plural: &str) {
        self.state()
            .served
            .entry(api_version.to_string())
            .or_default()
            .push(ApiResourceInfo {
                name: plural.to_string(),
                kind: kind.to_string(),
                namespaced: true,
            });
    }

    /// Store an object directly, bypassing call counting.
    ///
    /// The object's `types` must be set. A uid and resourceVersion are
    /// assigned when missing.
    pub fn insert(&self, mut obj: DynamicObject) -> ResourceKey {
        let key = ResourceKey::of(&obj).expect("inserted object needs types and a name");
        let mut state = self.state();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(state.next_uid());
        }
        obj.metadata.resource_version = Some(state.next_version());
        obj.metadata.generation.get_or_insert(1);
        state.objects.insert(key.clone(), obj);
        key
    }

    /// The stored object, if any
    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.state().objects.get(key).cloned()
    }

    /// Whether an object is stored under `key`
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state().objects.contains_key(key)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    /// Whether the cluster holds no objects
    pub fn is_empty(&self) -> bool {
        self.state().objects.is_empty()
    }

    /// Replace the stored object's status, as a controller in the cluster would
    pub fn set_status(&self, key: &ResourceKey, status: Value) {
        let mut state = self.state();
        let version = state.next_version();
        if let Some(obj) = state.objects.get_mut(key) {
            obj.data["status"] = status;
            obj.metadata.resource_version = Some(version);
        }
    }

    /// Make every `op` call on objects named `name` fail with HTTP `code`
    pub fn fail_on(&self, op: FakeOp, name: &str, code: u16) {
        self.state().failures.insert((op, name.to_string()), code);
    }

    /// Call counts since construction or the last [`FakeCluster::reset_calls`]
    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Zero the call counters
    pub fn reset_calls(&self) {
        self.state().calls = CallCounts::default();
    }
}

fn key_for(resource: &ApiResource, namespace: &str, name: &str) -> ResourceKey {
    let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
    ResourceKey::new(gvk, namespace, name)
}

fn object_key(resource: &ApiResource, obj: &DynamicObject) -> Result<ResourceKey, Error> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| api_error(422, "Invalid", "metadata.name is required"))?;
    Ok(key_for(
        resource,
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        name,
    ))
}

/// Everything except metadata and status
fn desired_fields(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let mut state = self.state();
        state.calls.gets += 1;
        if let Some(err) = state.injected_failure(FakeOp::Get, name) {
            return Err(err);
        }
        Ok(state.objects.get(&key_for(resource, namespace, name)).cloned())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = object_key(resource, obj)?;
        let mut state = self.state();
        state.calls.creates += 1;
        if let Some(err) = state.injected_failure(FakeOp::Create, &key.name) {
            return Err(err);
        }
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} already exists", key)));
        }

        let mut stored = obj.clone();
        stored.types = Some(TypeMeta {
            api_version: api_version_of(&key.gvk),
            kind: key.gvk.kind.clone(),
        });
        stored.metadata.uid = Some(state.next_uid());
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.generation = Some(1);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = object_key(resource, obj)?;
        let mut state = self.state();
        state.calls.updates += 1;
        if let Some(err) = state.injected_failure(FakeOp::Update, &key.name) {
            return Err(err);
        }
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{} not found", key)));
        };
        if let Some(version) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(version) {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("{} has been modified; please apply your changes to the latest version", key),
                ));
            }
        }

        let mut stored = obj.clone();
        stored.types = current.types.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        // Status is a subresource: replaces of the main resource never touch it
        match current.data.get("status") {
            Some(status) => stored.data["status"] = status.clone(),
            None => {
                if let Some(map) = stored.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = Some(if desired_fields(&current) == desired_fields(&stored) {
            generation
        } else {
            generation + 1
        });
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
        let key = key_for(resource, namespace, name);
        let mut state = self.state();
        state.calls.deletes += 1;
        if let Some(err) = state.injected_failure(FakeOp::Delete, name) {
            return Err(err);
        }
        match state.objects.remove(&key) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound", format!("{} not found", key))),
        }
    }

    async fn list_api_resources(&self, group_version: &str) -> Result<Vec<ApiResourceInfo>, Error> {
        let mut state = self.state();
        state.calls.discoveries += 1;
        let (group, version) = parse_api_version(group_version);
        state.served.get(group_version).cloned().ok_or_else(|| {
            api_error(
                404,
                "NotFound",
                format!("the server could not find the requested resource (group {:?}, version {})", group, version),
            )
        })
    }
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Name of the object the event is about
    pub object: String,
    /// Whether the event was a Warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// [`EventPublisher`] that keeps every event in memory
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    /// An empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    /// Reasons of all events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().expect("event log poisoned").push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
