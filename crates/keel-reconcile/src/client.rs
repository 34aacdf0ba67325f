//! Cluster access seam
//!
//! Everything the engine, pruner and job runner need from the API server
//! goes through [`ClusterClient`], so tests can substitute a mock or the
//! in-memory fake.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use keel_common::Error;

/// One resource type served by an API group/version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResourceInfo {
    /// Plural resource name (e.g. "deployments")
    pub name: String,
    /// Kind (e.g. "Deployment")
    pub kind: String,
    /// Whether the resource is namespace-scoped
    pub namespaced: bool,
}

/// Trait abstracting the Kubernetes API operations used by keel
///
/// An empty `namespace` addresses cluster-scoped resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object, returning `None` when it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create an object
    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace an object. The object's resourceVersion guards against
    /// concurrent writers.
    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object. `NotFound` is returned as an error.
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str)
        -> Result<(), Error>;

    /// List the resources served by a group/version ("v1", "apps/v1", ...)
    async fn list_api_resources(&self, group_version: &str)
        -> Result<Vec<ApiResourceInfo>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str, Error> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("client", "object has no metadata.name"))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        trace!(kind = %resource.kind, namespace, name, "get");
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        Ok(self
            .api(resource, namespace)
            .create(&self.post_params(), obj)
            .await?)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        Ok(self
            .api(resource, namespace)
            .replace(object_name(obj)?, &self.post_params(), obj)
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn list_api_resources(
        &self,
        group_version: &str,
    ) -> Result<Vec<ApiResourceInfo>, Error> {
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await?
        } else {
            self.client.list_core_api_resources(group_version).await?
        };
        Ok(list
            .resources
            .into_iter()
            // "deployments/status" and friends are subresources, not kinds
            .filter(|r| !r.name.contains('/'))
            .map(|r| ApiResourceInfo {
                name: r.name,
                kind: r.kind,
                namespaced: r.namespaced,
            })
            .collect())
    }
}
