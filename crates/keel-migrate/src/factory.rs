//! Batch Jobs for schema migration steps

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use keel_common::{Error, Result, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KEEL};

use crate::jobs::{JobFactory, MigrationJob};
use crate::persistence::{DatastoreSpec, PersistenceOwner, PersistenceSpec, StoreRole};
use crate::plan::{planned_jobs, JobPlan};
use crate::scripts::SCRIPTS_MOUNT_PATH;

/// Label carrying the migration step name
pub const LABEL_MIGRATION: &str = "keel.dev/migration";

/// Pod retries before the Job is marked failed
pub const BACKOFF_LIMIT: i32 = 3;

/// Job names end up in the `job-name` pod label
const MAX_JOB_NAME_LEN: usize = 63;

const SCRIPTS_VOLUME: &str = "schema-scripts";
const CONTAINER_NAME: &str = "migrate";

/// Builds one Job per migration step, running the step's script from the
/// scripts ConfigMap with the target store's connection environment.
///
/// Jobs get no TTL: a finished Job must still exist when its success is
/// recorded on the owner.
#[derive(Debug, Clone)]
pub struct SchemaJobFactory {
    image: String,
    scripts_configmap: String,
}

impl SchemaJobFactory {
    /// `image` must provide the SQL and Cassandra tools, `curl` and the
    /// versioned schema files
    pub fn new(image: impl Into<String>, scripts_configmap: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            scripts_configmap: scripts_configmap.into(),
        }
    }

    /// Every Job of the standard sequence for `spec`, in order
    pub fn jobs_for_spec(
        &self,
        owner: &str,
        namespace: Option<String>,
        spec: &PersistenceSpec,
    ) -> Result<Vec<Job>> {
        planned_jobs(spec)
            .iter()
            .map(|plan| self.job_for(owner, namespace.clone(), plan, store_for(spec, plan)?))
            .collect()
    }

    fn job_for(
        &self,
        owner: &str,
        namespace: Option<String>,
        plan: &JobPlan,
        store: &DatastoreSpec,
    ) -> Result<Job> {
        let name = format!("{owner}-{}", plan.name);
        if name.len() > MAX_JOB_NAME_LEN {
            return Err(Error::validation_for_field(
                "metadata.name",
                format!("job name {name} is longer than {MAX_JOB_NAME_LEN} characters"),
            ));
        }

        let labels = BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_KEEL.to_string()),
            (LABEL_INSTANCE.to_string(), owner.to_string()),
            (LABEL_MIGRATION.to_string(), plan.name.clone()),
        ]);

        let mut env = connection_env(plan.role, store);
        if let Some(version) = plan.schema_version() {
            env.push(plain_env("SCHEMA_VERSION", version));
        }

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(name),
                namespace,
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(BACKOFF_LIMIT),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".to_string()),
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: Some(self.image.clone()),
                            command: Some(plan.command()),
                            env: Some(env),
                            volume_mounts: Some(vec![VolumeMount {
                                name: SCRIPTS_VOLUME.to_string(),
                                mount_path: SCRIPTS_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: SCRIPTS_VOLUME.to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: self.scripts_configmap.clone(),
                                default_mode: Some(0o755),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

impl<O: PersistenceOwner> JobFactory<O> for SchemaJobFactory {
    fn build(&self, owner: &O, job: &MigrationJob<O>) -> Result<Job> {
        let spec = owner.persistence_spec();
        let plan = planned_jobs(spec)
            .into_iter()
            .find(|p| p.name == job.name())
            .ok_or_else(|| Error::validation(format!("no migration step named {}", job.name())))?;
        self.job_for(&owner.name_any(), owner.namespace(), &plan, store_for(spec, &plan)?)
    }
}

fn store_for<'a>(spec: &'a PersistenceSpec, plan: &JobPlan) -> Result<&'a DatastoreSpec> {
    spec.store(plan.role)
        .ok_or_else(|| Error::validation(format!("{} has no configured store", plan.name)))
}

fn plain_env(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// `<ROLE>_HOST`, `_PORT`, `_DATABASE`, `_USER`, `_TLS` and `_PASSWORD`
/// (from the store's secret)
fn connection_env(role: StoreRole, store: &DatastoreSpec) -> Vec<EnvVar> {
    let prefix = role.env_prefix();
    vec![
        plain_env(format!("{prefix}_HOST"), &store.host),
        plain_env(format!("{prefix}_PORT"), store.port.to_string()),
        plain_env(format!("{prefix}_DATABASE"), &store.database),
        plain_env(format!("{prefix}_USER"), &store.user),
        plain_env(format!("{prefix}_TLS"), store.tls.to_string()),
        EnvVar {
            name: format!("{prefix}_PASSWORD"),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: store.password_secret.name.clone(),
                    key: store.password_secret.key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}
