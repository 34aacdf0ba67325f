//! Readiness of managed resources
//!
//! Readiness is never stored: every pass recomputes it from the live
//! object's observed fields with a kind-agnostic rollout predicate.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_common::kube_utils::{condition_status, has_condition, STATUS_TRUE};

use crate::resource::ResourceKey;

/// Condition type set on the owner by [`aggregate_ready_condition`]
pub const CONDITION_READY: &str = "Ready";
/// Reason when every managed resource is ready
pub const REASON_ALL_READY: &str = "AllResourcesReady";
/// Reason when at least one managed resource is not ready
pub const REASON_NOT_READY: &str = "ResourcesNotReady";

/// Conditions that, when present, must be "True"
const POSITIVE_CONDITIONS: &[&str] = &["Ready", "Available"];
/// Conditions that, when "True", mean the rollout cannot complete
const NEGATIVE_CONDITIONS: &[&str] = &["Stalled", "Failed"];
/// `status.phase` values of objects that are not (yet) usable
const UNREADY_PHASES: &[&str] = &["Pending", "Failed", "Unknown", "Lost"];

/// Observed state of one managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Group, version and kind
    pub gvk: GroupVersionKind,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Labels of the live object
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Whether the rollout is complete
    pub ready: bool,
}

impl ResourceStatus {
    /// Build the status of a live object using the generic rollout predicate
    pub fn observe(key: &ResourceKey, live: &DynamicObject) -> Self {
        Self::with_readiness(key, live, is_rollout_complete(live))
    }

    /// Build a status with readiness decided by the caller
    pub fn with_readiness(key: &ResourceKey, live: &DynamicObject, ready: bool) -> Self {
        Self {
            gvk: key.gvk.clone(),
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            labels: live.metadata.labels.clone().unwrap_or_default(),
            ready,
        }
    }
}

/// Whether a live object's rollout is complete.
///
/// Objects without status-bearing fields are complete as soon as they
/// exist. Otherwise all of the following must hold:
/// - not being deleted
/// - `status.observedGeneration` has caught up with `metadata.generation`
/// - `Ready`/`Available` conditions, when present, are "True"
/// - `Stalled`/`Failed` conditions are not "True"
/// - `status.phase`, when present, is not Pending/Failed/Unknown/Lost
/// - replica counters have reached `spec.replicas` (or
///   `status.desiredNumberScheduled` for daemon-style kinds)
pub fn is_rollout_complete(live: &DynamicObject) -> bool {
    if live.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let data = &live.data;
    let status = data.get("status").unwrap_or(&Value::Null);

    if let (Some(generation), Some(observed)) = (
        live.metadata.generation,
        status.get("observedGeneration").and_then(Value::as_i64),
    ) {
        if observed < generation {
            return false;
        }
    }

    if NEGATIVE_CONDITIONS.iter().any(|t| has_condition(data, t)) {
        return false;
    }
    if POSITIVE_CONDITIONS
        .iter()
        .filter_map(|t| condition_status(data, t))
        .any(|s| s != STATUS_TRUE)
    {
        return false;
    }

    if let Some(phase) = status.get("phase").and_then(Value::as_str) {
        if UNREADY_PHASES.contains(&phase) {
            return false;
        }
    }

    if let Some(desired) = data.pointer("/spec/replicas").and_then(Value::as_i64) {
        if counter(status, "readyReplicas") < desired {
            return false;
        }
        for optional in ["updatedReplicas", "availableReplicas"] {
            if let Some(n) = status.get(optional).and_then(Value::as_i64) {
                if n < desired {
                    return false;
                }
            }
        }
    }

    if let Some(desired) = status.get("desiredNumberScheduled").and_then(Value::as_i64) {
        if counter(status, "numberReady") < desired {
            return false;
        }
        if let Some(updated) = status.get("updatedNumberScheduled").and_then(Value::as_i64) {
            if updated < desired {
                return false;
            }
        }
    }

    true
}

fn counter(status: &Value, field: &str) -> i64 {
    status.get(field).and_then(Value::as_i64).unwrap_or(0)
}

/// Fold per-resource statuses into the owner's `Ready` condition
pub fn aggregate_ready_condition(
    statuses: &[ResourceStatus],
    observed_generation: Option<i64>,
) -> Condition {
    let unready: Vec<String> = statuses
        .iter()
        .filter(|s| !s.ready)
        .map(|s| format!("{}/{}", s.gvk.kind, s.name))
        .collect();

    let (status, reason, message) = if unready.is_empty() {
        (
            STATUS_TRUE,
            REASON_ALL_READY,
            format!("{} resources ready", statuses.len()),
        )
    } else {
        (
            "False",
            REASON_NOT_READY,
            format!("waiting for {}", unready.join(", ")),
        )
    };

    Condition {
        type_: CONDITION_READY.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}
