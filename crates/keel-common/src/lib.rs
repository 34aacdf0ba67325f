//! Common types for keel: errors, Kubernetes helpers, events, configuration
//! and telemetry.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use config::ReconcilerConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key identifying the component that manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for resources created by keel
pub const LABEL_MANAGED_BY_KEEL: &str = "keel";

/// Label key carrying the name of the owning object
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
