//! Ordered, polling-based execution of one-shot migration jobs
//!
//! Jobs run strictly in the declared order. A job whose `skip` check passes
//! is never submitted; otherwise its batch Job is created if missing and
//! polled. Until it reports one success the remaining jobs wait and the
//! caller is asked to requeue. On success `report_success` records the
//! result on the owner so the next pass skips it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::discovery::ApiResource;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use keel_common::events::{actions, reasons, EventPublisher};
use keel_common::kube_utils::{ensure_owner_reference, has_condition};
use keel_common::{ReconcilerConfig, Result};
use keel_reconcile::resource::to_dynamic;
use keel_reconcile::{ClusterClient, ResourceKey};

type SkipFn<O> = Box<dyn Fn(&O) -> bool + Send + Sync>;
type ReportFn<O> = Box<dyn Fn(&mut O) -> Result<()> + Send + Sync>;

/// One step of a migration sequence
pub struct MigrationJob<O> {
    name: String,
    command: Vec<String>,
    skip: SkipFn<O>,
    report_success: ReportFn<O>,
}

impl<O: 'static> MigrationJob<O> {
    /// A job that always runs and records nothing
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            skip: Box::new(|_: &O| false),
            report_success: Box::new(|_: &mut O| Ok(())),
        }
    }
}

impl<O> MigrationJob<O> {
    /// Skip the job when `skip` returns true for the owner
    pub fn skip_when(mut self, skip: impl Fn(&O) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Box::new(skip);
        self
    }

    /// Record success on the owner once the job has succeeded
    pub fn on_success(
        mut self,
        report: impl Fn(&mut O) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.report_success = Box::new(report);
        self
    }

    /// Job name, unique within a sequence
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container command
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Whether the owner already records this job as done
    pub fn should_skip(&self, owner: &O) -> bool {
        (self.skip)(owner)
    }

    /// Record success on the owner
    pub fn report_success(&self, owner: &mut O) -> Result<()> {
        (self.report_success)(owner)
    }
}

impl<O> fmt::Debug for MigrationJob<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationJob")
            .field("name", &self.name)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Builds the batch Job that executes a migration step for an owner
pub trait JobFactory<O>: Send + Sync {
    /// The Job to submit. Must carry name and namespace.
    fn build(&self, owner: &O, job: &MigrationJob<O>) -> Result<Job>;
}

/// Runs migration sequences against the cluster
pub struct JobRunner {
    client: Arc<dyn ClusterClient>,
    events: Arc<dyn EventPublisher>,
    config: ReconcilerConfig,
}

impl JobRunner {
    /// Create a runner
    pub fn new(
        client: Arc<dyn ClusterClient>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            events,
            config,
        }
    }

    /// Walk `jobs` in order.
    ///
    /// Returns `Some(delay)` when a job is still running and the sequence
    /// should be resumed later, `None` once every job has succeeded or been
    /// skipped. Successes are recorded on `owner` as they are observed, so
    /// the caller must persist the owner's status even on a requeue.
    #[instrument(skip_all, fields(owner = %owner.name_any(), jobs = jobs.len()))]
    pub async fn run_jobs<O, F>(
        &self,
        owner: &mut O,
        factory: &F,
        jobs: &[MigrationJob<O>],
    ) -> Result<Option<Duration>>
    where
        O: Resource<DynamicType = ()> + Send + Sync,
        F: JobFactory<O> + ?Sized,
    {
        let resource = ApiResource::erase::<Job>(&());
        let object_ref = owner.object_ref(&());
        let owner_ref = owner.controller_owner_ref(&());

        for job in jobs {
            if job.should_skip(owner) {
                debug!(job = job.name(), "already applied, skipping");
                continue;
            }

            let mut desired = to_dynamic(&factory.build(owner, job)?)?;
            let key = ResourceKey::of(&desired)?;

            let live = match self.client.get(&resource, &key.namespace, &key.name).await? {
                Some(live) => live,
                None => {
                    if let Some(owner_ref) = &owner_ref {
                        ensure_owner_reference(&mut desired.metadata, owner_ref);
                    }
                    let created = self.client.create(&resource, &desired).await?;
                    info!(job = job.name(), resource = %key, "migration job created");
                    self.events
                        .publish(
                            &object_ref,
                            EventType::Normal,
                            reasons::JOB_CREATED,
                            actions::MIGRATE,
                            Some(format!("started {}", job.name())),
                        )
                        .await;
                    created
                }
            };

            if !has_succeeded(&live.data) {
                if has_condition(&live.data, "Failed") {
                    warn!(
                        job = job.name(),
                        resource = %key,
                        "migration job failed; delete it to retry"
                    );
                } else {
                    debug!(job = job.name(), "migration job still running");
                }
                return Ok(Some(self.config.job_requeue));
            }

            job.report_success(owner)?;
            info!(job = job.name(), "migration job succeeded");
            self.events
                .publish(
                    &object_ref,
                    EventType::Normal,
                    reasons::JOB_SUCCEEDED,
                    actions::MIGRATE,
                    Some(format!("{} succeeded", job.name())),
                )
                .await;
        }

        Ok(None)
    }
}

/// A Job is done when exactly one pod has succeeded; anything else is
/// still running.
fn has_succeeded(job: &Value) -> bool {
    job.pointer("/status/succeeded").and_then(Value::as_i64) == Some(1)
}
