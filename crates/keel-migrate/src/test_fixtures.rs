//! Owner type and datastore fixtures shared by the crate's tests

use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::persistence::{
    DatastoreDriver, DatastoreSpec, PersistenceOwner, PersistenceSpec, PersistenceStatus,
    SecretKeyRef,
};

/// Minimal application cluster owning its datastores
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "AppCluster",
    namespaced,
    status = "AppClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AppClusterSpec {
    pub persistence: PersistenceSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppClusterStatus {
    #[serde(default)]
    pub persistence: PersistenceStatus,
}

impl PersistenceOwner for AppCluster {
    fn persistence_spec(&self) -> &PersistenceSpec {
        &self.spec.persistence
    }

    fn persistence_status(&self) -> Option<&PersistenceStatus> {
        self.status.as_ref().map(|s| &s.persistence)
    }

    fn persistence_status_mut(&mut self) -> &mut PersistenceStatus {
        &mut self.status.get_or_insert_with(Default::default).persistence
    }
}

pub fn store(name: &str, driver: DatastoreDriver, port: u16) -> DatastoreSpec {
    DatastoreSpec {
        name: name.to_string(),
        driver,
        host: format!("{name}.db.svc"),
        port,
        database: name.replace('-', "_"),
        user: "keel".to_string(),
        password_secret: SecretKeyRef {
            name: format!("{name}-credentials"),
            key: "password".to_string(),
        },
        tls: false,
    }
}

pub fn elasticsearch() -> DatastoreSpec {
    store("search", DatastoreDriver::Elasticsearch, 9200)
}

pub fn persistence_spec() -> PersistenceSpec {
    PersistenceSpec {
        default_store: store("main", DatastoreDriver::Postgres, 5432),
        visibility_store: store("visibility", DatastoreDriver::Postgres, 5432),
        advanced_visibility_store: None,
        schema_version: "1.12".to_string(),
    }
}

pub fn app_cluster_with(persistence: PersistenceSpec) -> AppCluster {
    AppCluster {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            namespace: Some("prod".to_string()),
            uid: Some("demo-uid".to_string()),
            ..Default::default()
        },
        spec: AppClusterSpec { persistence },
        status: None,
    }
}

pub fn app_cluster() -> AppCluster {
    app_cluster_with(persistence_spec())
}
