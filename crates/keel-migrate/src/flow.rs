//! Persistence reconciliation: scripts first, then the job sequence

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, instrument};

use keel_common::Result;
use keel_reconcile::{Reconciler, Typed};

use crate::factory::SchemaJobFactory;
use crate::jobs::JobRunner;
use crate::persistence::PersistenceOwner;
use crate::plan::schema_jobs;
use crate::scripts::SchemaScriptsBuilder;

/// Drives an owner's datastores to its declared schema version
pub struct PersistenceReconciler {
    engine: Arc<Reconciler>,
    runner: JobRunner,
    image: String,
}

impl PersistenceReconciler {
    /// Jobs run `image`, which must ship the migration tools
    pub fn new(engine: Arc<Reconciler>, image: impl Into<String>) -> Self {
        let runner = JobRunner::new(
            engine.client().clone(),
            engine.events().clone(),
            engine.config().clone(),
        );
        Self {
            engine,
            runner,
            image: image.into(),
        }
    }

    /// One pass: validate, bring the scripts ConfigMap up to date, then
    /// advance the migration sequence.
    ///
    /// Returns the requeue delay while scripts or jobs are pending. Job
    /// successes are recorded on `owner`'s status, which the caller
    /// persists.
    #[instrument(skip_all, fields(owner = %owner.name_any()))]
    pub async fn reconcile<O>(&self, owner: &mut O) -> Result<Option<Duration>>
    where
        O: PersistenceOwner + 'static,
    {
        let spec = owner.persistence_spec().clone();
        spec.validate()?;

        let scripts = SchemaScriptsBuilder::new(&*owner)?;
        let scripts_configmap = scripts.name().to_string();
        let outcome = self
            .engine
            .reconcile(&*owner, &[Typed::boxed(scripts)])
            .await?;
        if outcome.is_deferred() {
            debug!("schema scripts not ready");
            return Ok(outcome.requeue_after);
        }

        let factory = SchemaJobFactory::new(self.image.clone(), scripts_configmap);
        let jobs = schema_jobs::<O>(&spec);
        self.runner.run_jobs(owner, &factory, &jobs).await
    }
}
