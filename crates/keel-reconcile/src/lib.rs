//! Declarative reconciliation engine for keel
//!
//! Turns a list of resource builders into create/update/delete calls
//! against a Kubernetes cluster:
//! - [`discovery`]: memoized "does this cluster serve this GVK?" lookups
//! - [`builder`]: the builder abstraction and its typed adapter
//! - [`engine`]: ordering, dependency gating, diff-and-write, readiness
//! - [`index`] / [`prune`]: desired-state tracking and orphan removal

#![deny(missing_docs)]

pub mod builder;
pub mod client;
pub mod compare;
pub mod discovery;
pub mod engine;
pub mod index;
pub mod prune;
pub mod resource;
pub mod status;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use builder::{ResourceBuilder, Typed, TypedBuilder};
pub use client::{ApiResourceInfo, ClusterClient, KubeClusterClient};
pub use compare::{Comparator, Comparators};
pub use discovery::DiscoveryCache;
pub use engine::{Operation, OperationKind, ReconcileOutcome, Reconciler};
pub use index::DesiredStateIndex;
pub use resource::{OwnerInfo, ResourceKey};
pub use status::ResourceStatus;
