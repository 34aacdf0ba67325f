//! Schema migrations for keel-managed datastores
//!
//! - [`jobs`]: generic ordered, polling job sequencing
//! - [`persistence`]: datastore model and the owner contract
//! - [`plan`]: the standard create/setup/update sequence
//! - [`scripts`] / [`factory`]: the scripts ConfigMap and per-step Jobs
//! - [`flow`]: the full persistence pass

#![deny(missing_docs)]

pub mod factory;
pub mod flow;
pub mod jobs;
pub mod persistence;
pub mod plan;
pub mod scripts;

#[cfg(test)]
mod test_fixtures;

pub use factory::SchemaJobFactory;
pub use flow::PersistenceReconciler;
pub use jobs::{JobFactory, JobRunner, MigrationJob};
pub use persistence::{
    DatastoreDriver, DatastoreSpec, DatastoreStatus, PersistenceOwner, PersistenceSpec,
    PersistenceStatus, SecretKeyRef, StoreRole,
};
pub use plan::{planned_jobs, schema_jobs, JobPlan, Step};
pub use scripts::{SchemaScriptsBuilder, ScriptRenderer};
