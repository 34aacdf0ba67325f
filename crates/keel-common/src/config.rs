//! Reconciler configuration
//!
//! Flattened into the command line of any binary that hosts the engine;
//! every flag can also be supplied through its environment variable.

use std::time::Duration;

use clap::Args;

/// Default server-side field manager name
pub const DEFAULT_FIELD_MANAGER: &str = "keel-controller";

/// Default requeue delay when a dependency is missing or not ready
pub const DEFAULT_DEPENDENCY_REQUEUE: Duration = Duration::from_secs(5);

/// Default requeue delay while a migration job is still running
pub const DEFAULT_JOB_REQUEUE: Duration = Duration::from_secs(10);

/// Tunables shared by the reconciliation engine and the job runner
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Field manager recorded on every write
    #[arg(long, env = "KEEL_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,

    /// Controller name reported on Kubernetes Events
    #[arg(long, env = "KEEL_CONTROLLER_NAME", default_value = "keel")]
    pub controller_name: String,

    /// Seconds to wait before retrying when a dependency is not ready
    #[arg(long = "dependency-requeue-secs", env = "KEEL_DEPENDENCY_REQUEUE_SECS", default_value = "5", value_parser = parse_secs)]
    pub dependency_requeue: Duration,

    /// Seconds to wait before polling a running migration job again
    #[arg(long = "job-requeue-secs", env = "KEEL_JOB_REQUEUE_SECS", default_value = "10", value_parser = parse_secs)]
    pub job_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            controller_name: "keel".to_string(),
            dependency_requeue: DEFAULT_DEPENDENCY_REQUEUE,
            job_requeue: DEFAULT_JOB_REQUEUE,
        }
    }
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("invalid number of seconds '{}': {}", value, e))
}
