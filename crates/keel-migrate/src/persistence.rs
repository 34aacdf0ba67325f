//! Datastore model for schema migrations
//!
//! An owner declares up to three stores: the default store, the
//! visibility store, and an optional Elasticsearch-backed advanced
//! visibility store. Migration progress is recorded per store in the
//! owner's status so finished steps are skipped on later passes.

use std::fmt;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use keel_common::{Error, Result};

/// Datastore engine
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreDriver {
    /// PostgreSQL
    Postgres,
    /// MySQL
    MySql,
    /// Apache Cassandra
    Cassandra,
    /// Elasticsearch (advanced visibility only)
    Elasticsearch,
}

impl DatastoreDriver {
    /// Whether the driver is a SQL database handled by the SQL tool
    pub fn is_sql(self) -> bool {
        matches!(self, Self::Postgres | Self::MySql)
    }
}

impl fmt::Display for DatastoreDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Cassandra => "cassandra",
            Self::Elasticsearch => "elasticsearch",
        };
        f.write_str(s)
    }
}

/// Reference to one key of a Secret in the owner's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

/// Connection parameters of one datastore
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreSpec {
    /// Logical name, used in log context
    pub name: String,
    /// Datastore engine
    pub driver: DatastoreDriver,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Database, keyspace or index name
    pub database: String,
    /// User to connect as
    pub user: String,
    /// Password source
    pub password_secret: SecretKeyRef,
    /// Connect over TLS
    #[serde(default)]
    pub tls: bool,
}

/// Datastores of an owner and the schema version they should run
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Main store
    pub default_store: DatastoreSpec,
    /// Visibility store
    pub visibility_store: DatastoreSpec,
    /// Elasticsearch store for advanced visibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_visibility_store: Option<DatastoreSpec>,
    /// Target schema version, e.g. "1.12"
    pub schema_version: String,
}

impl PersistenceSpec {
    /// Validate the store configuration
    ///
    /// Default and visibility stores must be SQL or Cassandra; the advanced
    /// visibility store must be Elasticsearch.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim().is_empty() {
            return Err(Error::validation_for_field(
                "schemaVersion",
                "schema version cannot be empty",
            ));
        }
        if !is_dotted_version(&self.schema_version) {
            return Err(Error::validation_for_field(
                "schemaVersion",
                format!("invalid schema version {:?}", self.schema_version),
            ));
        }

        for (role, store) in [
            (StoreRole::Default, &self.default_store),
            (StoreRole::Visibility, &self.visibility_store),
        ] {
            validate_store(store, role)?;
            if store.driver == DatastoreDriver::Elasticsearch {
                return Err(Error::validation_for_field(
                    format!("{}.driver", role.field()),
                    "elasticsearch can only back the advanced visibility store",
                ));
            }
        }

        if let Some(store) = &self.advanced_visibility_store {
            validate_store(store, StoreRole::AdvancedVisibility)?;
            if store.driver != DatastoreDriver::Elasticsearch {
                return Err(Error::validation_for_field(
                    format!("{}.driver", StoreRole::AdvancedVisibility.field()),
                    format!("advanced visibility requires elasticsearch, got {}", store.driver),
                ));
            }
        }
        Ok(())
    }

    /// The store configured for `role`
    pub fn store(&self, role: StoreRole) -> Option<&DatastoreSpec> {
        match role {
            StoreRole::Default => Some(&self.default_store),
            StoreRole::Visibility => Some(&self.visibility_store),
            StoreRole::AdvancedVisibility => self.advanced_visibility_store.as_ref(),
        }
    }

    /// Configured stores with their roles, in migration order
    pub fn stores(&self) -> impl Iterator<Item = (StoreRole, &DatastoreSpec)> {
        StoreRole::ALL
            .into_iter()
            .filter_map(move |role| self.store(role).map(|store| (role, store)))
    }
}

/// Non-empty alphanumeric segments joined by single dots, so the version
/// stays a valid DNS label once dots become dashes in Job names
fn is_dotted_version(version: &str) -> bool {
    version
        .split('.')
        .all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn validate_store(store: &DatastoreSpec, role: StoreRole) -> Result<()> {
    let field = role.field();
    if store.host.is_empty() {
        return Err(Error::validation_for_field(format!("{field}.host"), "host cannot be empty"));
    }
    if store.port == 0 {
        return Err(Error::validation_for_field(format!("{field}.port"), "port cannot be 0"));
    }
    if store.database.is_empty() {
        return Err(Error::validation_for_field(
            format!("{field}.database"),
            "database cannot be empty",
        ));
    }
    if store.password_secret.name.is_empty() || store.password_secret.key.is_empty() {
        return Err(Error::validation_for_field(
            format!("{field}.passwordSecret"),
            "password secret needs a name and a key",
        ));
    }
    Ok(())
}

/// Which of the owner's stores a migration step targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreRole {
    /// Main store
    Default,
    /// Visibility store
    Visibility,
    /// Elasticsearch advanced visibility store
    AdvancedVisibility,
}

impl StoreRole {
    /// All roles in migration order
    pub const ALL: [StoreRole; 3] = [Self::Default, Self::Visibility, Self::AdvancedVisibility];

    /// Prefix of the connection environment variables, e.g. `DEFAULT_HOST`
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Visibility => "VISIBILITY",
            Self::AdvancedVisibility => "ADVANCED_VISIBILITY",
        }
    }

    /// Slug used in job and script names
    pub fn slug(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Visibility => "visibility",
            Self::AdvancedVisibility => "advanced-visibility",
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Default => "defaultStore",
            Self::Visibility => "visibilityStore",
            Self::AdvancedVisibility => "advancedVisibilityStore",
        }
    }
}

/// Migration progress of one store
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreStatus {
    /// Database or keyspace exists
    #[serde(default)]
    pub created: bool,
    /// Base schema applied
    #[serde(default)]
    pub setup: bool,
    /// Last schema version successfully applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

/// Migration progress of every store
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStatus {
    /// Main store
    #[serde(default)]
    pub default_store: DatastoreStatus,
    /// Visibility store
    #[serde(default)]
    pub visibility_store: DatastoreStatus,
    /// Advanced visibility store
    #[serde(default)]
    pub advanced_visibility_store: DatastoreStatus,
}

impl PersistenceStatus {
    /// Progress of the store in `role`
    pub fn store(&self, role: StoreRole) -> &DatastoreStatus {
        match role {
            StoreRole::Default => &self.default_store,
            StoreRole::Visibility => &self.visibility_store,
            StoreRole::AdvancedVisibility => &self.advanced_visibility_store,
        }
    }

    /// Mutable progress of the store in `role`
    pub fn store_mut(&mut self, role: StoreRole) -> &mut DatastoreStatus {
        match role {
            StoreRole::Default => &mut self.default_store,
            StoreRole::Visibility => &mut self.visibility_store,
            StoreRole::AdvancedVisibility => &mut self.advanced_visibility_store,
        }
    }
}

/// A resource that owns datastores and records their migration progress.
///
/// Status changes made through [`PersistenceOwner::persistence_status_mut`]
/// are in-memory only; the caller persists them after the pass.
pub trait PersistenceOwner: Resource<DynamicType = ()> + Send + Sync {
    /// Declared datastores
    fn persistence_spec(&self) -> &PersistenceSpec;

    /// Recorded progress, `None` before the first report
    fn persistence_status(&self) -> Option<&PersistenceStatus>;

    /// Recorded progress, initialized on first use
    fn persistence_status_mut(&mut self) -> &mut PersistenceStatus;
}
