//! Kubernetes Events emitted on keel owners
//!
//! Every event attaches to the owner object passed to the engine or job
//! runner, never to the managed resource itself, so `kubectl describe` on
//! the owner shows the full history of its children:
//! - the engine emits a Normal event per create, update, delete and prune,
//!   and a Warning `ReconcileFailed` when a write fails for any reason other
//!   than an optimistic-concurrency conflict
//! - the job runner emits `JobCreated` when it submits a migration Job and
//!   `JobSucceeded` once the Job's success has been recorded on the owner
//!
//! Publishing never fails the pass: recorder errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{trace, warn};

use crate::config::ReconcilerConfig;

/// API server limit on an event's note, in bytes
pub const MAX_NOTE_BYTES: usize = 1024;

/// Sink for owner events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on `owner`. `note` is the human-readable message,
    /// e.g. "ConfigMap prod/settings created".
    async fn publish(
        &self,
        owner: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the cluster's events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Events report `config.controller_name` as their component and the
    /// pod name (from `POD_NAME`) as the instance when running in-cluster.
    pub fn new(client: Client, config: &ReconcilerConfig) -> Self {
        let reporter = Reporter {
            controller: config.controller_name.clone(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        owner: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: note.map(truncate_note),
            action: action.to_string(),
            secondary: None,
        };
        match self.recorder.publish(&event, owner).await {
            Ok(()) => trace!(reason, owner = owner.name.as_deref(), "event published"),
            Err(e) => warn!(
                reason,
                action,
                owner = owner.name.as_deref(),
                error = %e,
                "failed to publish event"
            ),
        }
    }
}

/// Cut a note to [`MAX_NOTE_BYTES`] on a character boundary. Failure notes
/// embed API error bodies, which can exceed the limit.
pub fn truncate_note(mut note: String) -> String {
    if note.len() > MAX_NOTE_BYTES {
        let mut end = MAX_NOTE_BYTES;
        while !note.is_char_boundary(end) {
            end -= 1;
        }
        note.truncate(end);
    }
    note
}

/// Publisher that drops everything, for one-shot CLI runs and tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _owner: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A managed resource was created
    pub const RESOURCE_CREATED: &str = "ResourceCreated";
    /// A managed resource drifted and was updated
    pub const RESOURCE_UPDATED: &str = "ResourceUpdated";
    /// A disabled builder's resource was deleted
    pub const RESOURCE_DELETED: &str = "ResourceDeleted";
    /// An orphaned resource was removed by pruning
    pub const RESOURCE_PRUNED: &str = "ResourcePruned";
    /// A create/update/delete call failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// A migration job was submitted
    pub const JOB_CREATED: &str = "JobCreated";
    /// A migration job finished and its success was recorded
    pub const JOB_SUCCEEDED: &str = "JobSucceeded";
}

/// Well-known event action strings.
pub mod actions {
    /// Creating a resource
    pub const CREATE: &str = "Create";
    /// Updating a resource
    pub const UPDATE: &str = "Update";
    /// Deleting a resource
    pub const DELETE: &str = "Delete";
    /// Pruning an orphan
    pub const PRUNE: &str = "Prune";
    /// Running a migration job
    pub const MIGRATE: &str = "Migrate";
}
