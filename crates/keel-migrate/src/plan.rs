//! The standard schema migration sequence
//!
//! Per SQL or Cassandra store: create the database (keyspace for
//! Cassandra), apply the base schema, then update to the target version.
//! The Elasticsearch advanced visibility store only needs its index
//! bootstrapped. Default store first, then visibility, then advanced
//! visibility.

use crate::jobs::MigrationJob;
use crate::persistence::{DatastoreStatus, PersistenceOwner, PersistenceSpec, StoreRole};
use crate::scripts::SCRIPTS_MOUNT_PATH;

/// What a migration step does to its store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Create the database or keyspace
    CreateDatabase,
    /// Apply the base schema
    SetupSchema,
    /// Upgrade to the given schema version
    UpdateSchema(String),
    /// Create the Elasticsearch index template and index
    SetupAdvancedVisibility,
}

impl Step {
    /// Whether `status` records this step as done
    pub fn is_recorded(&self, status: &DatastoreStatus) -> bool {
        match self {
            Self::CreateDatabase => status.created,
            Self::SetupSchema | Self::SetupAdvancedVisibility => status.setup,
            Self::UpdateSchema(version) => status.schema_version.as_deref() == Some(version),
        }
    }

    /// Record this step as done in `status`
    pub fn record(&self, status: &mut DatastoreStatus) {
        match self {
            Self::CreateDatabase => status.created = true,
            Self::SetupSchema => status.setup = true,
            Self::SetupAdvancedVisibility => {
                status.created = true;
                status.setup = true;
            }
            Self::UpdateSchema(version) => status.schema_version = Some(version.clone()),
        }
    }
}

/// One planned step, before it is bound to an owner type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPlan {
    /// Job name, unique within the sequence
    pub name: String,
    /// Store the step runs against
    pub role: StoreRole,
    /// What the step does
    pub step: Step,
}

impl JobPlan {
    fn new(role: StoreRole, step: Step) -> Self {
        let slug = role.slug();
        let name = match &step {
            Step::CreateDatabase => format!("create-{slug}-database"),
            Step::SetupSchema => format!("setup-{slug}-schema"),
            Step::UpdateSchema(version) => {
                format!("update-{slug}-schema-v{}", version.replace('.', "-").to_lowercase())
            }
            Step::SetupAdvancedVisibility => format!("setup-{slug}"),
        };
        Self { name, role, step }
    }

    /// Key of the step's script in the scripts ConfigMap
    pub fn script(&self) -> String {
        let slug = self.role.slug();
        match &self.step {
            Step::CreateDatabase => format!("create-{slug}-database.sh"),
            Step::SetupSchema => format!("setup-{slug}-schema.sh"),
            Step::UpdateSchema(_) => format!("update-{slug}-schema.sh"),
            Step::SetupAdvancedVisibility => format!("setup-{slug}.sh"),
        }
    }

    /// Container command running the step's script
    pub fn command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            format!("{}/{}", SCRIPTS_MOUNT_PATH, self.script()),
        ]
    }

    /// Target schema version passed to the script, for update steps
    pub fn schema_version(&self) -> Option<&str> {
        match &self.step {
            Step::UpdateSchema(version) => Some(version),
            _ => None,
        }
    }
}

/// The ordered steps for `spec`
pub fn planned_jobs(spec: &PersistenceSpec) -> Vec<JobPlan> {
    let mut plans = Vec::new();
    for (role, _) in spec.stores() {
        match role {
            StoreRole::Default | StoreRole::Visibility => {
                plans.push(JobPlan::new(role, Step::CreateDatabase));
                plans.push(JobPlan::new(role, Step::SetupSchema));
                plans.push(JobPlan::new(
                    role,
                    Step::UpdateSchema(spec.schema_version.clone()),
                ));
            }
            StoreRole::AdvancedVisibility => {
                plans.push(JobPlan::new(role, Step::SetupAdvancedVisibility));
            }
        }
    }
    plans
}

/// The ordered migration jobs for `spec`, with skip checks and success
/// reports keyed off the owner's persistence status
pub fn schema_jobs<O: PersistenceOwner + 'static>(spec: &PersistenceSpec) -> Vec<MigrationJob<O>> {
    planned_jobs(spec)
        .into_iter()
        .map(|plan| {
            let JobPlan { name, role, step } = plan.clone();
            let recorded = step.clone();
            MigrationJob::new(name, plan.command())
                .skip_when(move |owner: &O| {
                    owner
                        .persistence_status()
                        .is_some_and(|status| recorded.is_recorded(status.store(role)))
                })
                .on_success(move |owner: &mut O| {
                    step.record(owner.persistence_status_mut().store_mut(role));
                    Ok(())
                })
        })
        .collect()
}
