//! Migration shell scripts
//!
//! Every planned step gets one script in the `<owner>-schema-scripts`
//! ConfigMap. Scripts read connection parameters from `<ROLE>_*`
//! environment variables set on the Job, and the target version from
//! `SCHEMA_VERSION`, so a version bump does not change the scripts.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use minijinja::{context, Environment, UndefinedBehavior};

use keel_common::{Error, Result, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KEEL};
use keel_reconcile::TypedBuilder;

use crate::persistence::{DatastoreDriver, DatastoreSpec, PersistenceOwner, PersistenceSpec, StoreRole};
use crate::plan::{planned_jobs, JobPlan, Step};

/// Where Jobs mount the scripts ConfigMap
pub const SCRIPTS_MOUNT_PATH: &str = "/etc/keel/scripts";

/// Root of the versioned schema files shipped in the admin tools image
pub const SCHEMA_ROOT: &str = "/etc/keel/schema";

const CONNECTION: &str = r#"set -eu
set -- --endpoint "${{ prefix }}_HOST" --port "${{ prefix }}_PORT" --user "${{ prefix }}_USER" --password "${{ prefix }}_PASSWORD"
if [ "${{ prefix }}_TLS" = "true" ]; then
  set -- "$@" --tls
fi
"#;

const SQL_CREATE: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec sql-tool --plugin {{ plugin }} "$@" --database "${{ prefix }}_DATABASE" create-database
"#;

const SQL_SETUP: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec sql-tool --plugin {{ plugin }} "$@" --database "${{ prefix }}_DATABASE" setup-schema --version 0.0
"#;

const SQL_UPDATE: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec sql-tool --plugin {{ plugin }} "$@" --database "${{ prefix }}_DATABASE" \
  update-schema --schema-dir {{ schema_dir }} --target-version "$SCHEMA_VERSION"
"#;

const CASSANDRA_CREATE: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec cassandra-tool "$@" create-keyspace --keyspace "${{ prefix }}_DATABASE" --replication-factor 1
"#;

const CASSANDRA_SETUP: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec cassandra-tool "$@" --keyspace "${{ prefix }}_DATABASE" setup-schema --version 0.0
"#;

const CASSANDRA_UPDATE: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
{% include "connection" %}
exec cassandra-tool "$@" --keyspace "${{ prefix }}_DATABASE" \
  update-schema --schema-dir {{ schema_dir }} --target-version "$SCHEMA_VERSION"
"#;

const ELASTICSEARCH_SETUP: &str = r#"#!/bin/sh
# {{ job }}: generated by keel
set -eu
scheme=http
if [ "${{ prefix }}_TLS" = "true" ]; then
  scheme=https
fi
url="$scheme://${{ prefix }}_HOST:${{ prefix }}_PORT"
auth="${{ prefix }}_USER:${{ prefix }}_PASSWORD"
curl --fail --silent --show-error --user "$auth" -X PUT \
  -H 'Content-Type: application/json' \
  --data-binary @{{ schema_dir }}/index_template.json \
  "$url/_index_template/${{ prefix }}_DATABASE"
if ! curl --fail --silent --user "$auth" --head "$url/${{ prefix }}_DATABASE" >/dev/null; then
  curl --fail --silent --show-error --user "$auth" -X PUT "$url/${{ prefix }}_DATABASE"
fi
"#;

const TEMPLATES: &[(&str, &str)] = &[
    ("connection", CONNECTION),
    ("sql/create-database", SQL_CREATE),
    ("sql/setup-schema", SQL_SETUP),
    ("sql/update-schema", SQL_UPDATE),
    ("cassandra/create-database", CASSANDRA_CREATE),
    ("cassandra/setup-schema", CASSANDRA_SETUP),
    ("cassandra/update-schema", CASSANDRA_UPDATE),
    ("elasticsearch/setup-advanced-visibility", ELASTICSEARCH_SETUP),
];

/// Renders migration scripts for planned steps
pub struct ScriptRenderer {
    env: Environment<'static>,
}

impl ScriptRenderer {
    /// Load the built-in templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .map_err(|e| Error::template(format!("{name}: {e}")))?;
        }
        Ok(Self { env })
    }

    /// Render the script for `plan` against `store`
    pub fn render(&self, plan: &JobPlan, store: &DatastoreSpec) -> Result<String> {
        let name = template_for(store.driver, &plan.step)?;
        let template = self
            .env
            .get_template(name)
            .map_err(|e| Error::template(format!("{name}: {e}")))?;
        template
            .render(context! {
                job => &plan.name,
                prefix => plan.role.env_prefix(),
                plugin => sql_plugin(store.driver),
                schema_dir => schema_dir(store.driver, plan.role),
            })
            .map_err(|e| Error::template(format!("{}: {e}", plan.name)))
    }
}

fn template_for(driver: DatastoreDriver, step: &Step) -> Result<&'static str> {
    let name = match (driver, step) {
        (d, Step::CreateDatabase) if d.is_sql() => "sql/create-database",
        (d, Step::SetupSchema) if d.is_sql() => "sql/setup-schema",
        (d, Step::UpdateSchema(_)) if d.is_sql() => "sql/update-schema",
        (DatastoreDriver::Cassandra, Step::CreateDatabase) => "cassandra/create-database",
        (DatastoreDriver::Cassandra, Step::SetupSchema) => "cassandra/setup-schema",
        (DatastoreDriver::Cassandra, Step::UpdateSchema(_)) => "cassandra/update-schema",
        (DatastoreDriver::Elasticsearch, Step::SetupAdvancedVisibility) => {
            "elasticsearch/setup-advanced-visibility"
        }
        (driver, step) => {
            return Err(Error::validation(format!(
                "{driver} stores do not support step {step:?}"
            )))
        }
    };
    Ok(name)
}

fn sql_plugin(driver: DatastoreDriver) -> &'static str {
    match driver {
        DatastoreDriver::Postgres => "postgres12",
        DatastoreDriver::MySql => "mysql8",
        _ => "",
    }
}

fn schema_dir(driver: DatastoreDriver, role: StoreRole) -> String {
    let store = match role {
        StoreRole::Default => "main",
        StoreRole::Visibility | StoreRole::AdvancedVisibility => "visibility",
    };
    match driver {
        DatastoreDriver::Elasticsearch => format!("{SCHEMA_ROOT}/{driver}/{store}"),
        _ => format!("{SCHEMA_ROOT}/{driver}/{store}/versioned"),
    }
}

/// Name of the scripts ConfigMap for an owner
pub fn scripts_configmap_name(owner: &str) -> String {
    format!("{owner}-schema-scripts")
}

/// Builder for the owner's scripts ConfigMap
#[derive(Debug, Clone)]
pub struct SchemaScriptsBuilder {
    name: String,
    namespace: Option<String>,
    owner: String,
    scripts: BTreeMap<String, String>,
}

impl SchemaScriptsBuilder {
    /// Render every script the owner's migration plan needs
    pub fn new<O: PersistenceOwner>(owner: &O) -> Result<Self> {
        Self::for_spec(&owner.name_any(), owner.namespace(), owner.persistence_spec())
    }

    /// Render the scripts for an owner known only by name
    pub fn for_spec(owner: &str, namespace: Option<String>, spec: &PersistenceSpec) -> Result<Self> {
        let renderer = ScriptRenderer::new()?;
        let mut scripts = BTreeMap::new();
        for plan in planned_jobs(spec) {
            let store = spec.store(plan.role).ok_or_else(|| {
                Error::internal_with_context("schema scripts", format!("no store for {}", plan.name))
            })?;
            scripts.insert(plan.script(), renderer.render(&plan, store)?);
        }

        Ok(Self {
            name: scripts_configmap_name(owner),
            namespace,
            owner: owner.to_string(),
            scripts,
        })
    }

    /// ConfigMap name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rendered scripts keyed by file name
    pub fn scripts(&self) -> &BTreeMap<String, String> {
        &self.scripts
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_KEEL.to_string()),
            (LABEL_INSTANCE.to_string(), self.owner.clone()),
        ])
    }
}

impl TypedBuilder for SchemaScriptsBuilder {
    type Kind = ConfigMap;

    fn build(&self) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: self.namespace.clone(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn update(&self, obj: &mut ConfigMap) -> Result<()> {
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(self.labels());
        obj.data = Some(self.scripts.clone());
        Ok(())
    }
}
