// Copyright 2025 The Tenama Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster-facing contract.
//!
//! [`ClusterClient`] is the seam between the lifecycle core and the
//! Kubernetes API: namespace CRUD, the filtered watch, and the auxiliary
//! objects created alongside a tenant namespace. Tests substitute an
//! in-memory implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use thiserror::Error;

use crate::quantity::ResourceKind;

/// Label key marking objects managed by this service.
pub const CREATED_BY_LABEL: &str = "created-by";

/// Label value marking objects managed by this service.
pub const CREATED_BY_VALUE: &str = "tenama";

/// Label selector matching all managed namespaces.
pub const MANAGED_SELECTOR: &str = "created-by=tenama";

/// Label carrying the declared namespace lifetime.
pub const DURATION_LABEL: &str = "tenama/namespace-duration";

/// The control plane's own namespace, never reclaimed.
pub const SYSTEM_NAMESPACE: &str = "tenama-system";

/// Label key carrying the reservation for a resource kind.
pub fn reservation_label(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Cpu => "tenama/resource-cpu",
        ResourceKind::Memory => "tenama/resource-memory",
        ResourceKind::Storage => "tenama/resource-storage",
    }
}

/// Errors from cluster-side operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The object already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The object does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Any other API failure.
    #[error("cluster request failed: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ClusterError {
    fn from_kube(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => {
                ClusterError::NotFound(name.to_string())
            }
            kube::Error::Api(ref response) if response.code == 409 => {
                ClusterError::AlreadyExists(name.to_string())
            }
            other => ClusterError::Upstream(Box::new(other)),
        }
    }
}

/// A listed set of managed namespaces together with the resource version
/// the subsequent watch should start from.
pub struct NamespaceListing {
    /// Namespaces matching the managed selector.
    pub items: Vec<Namespace>,
    /// List resource version.
    pub resource_version: String,
}

/// Stream of watch events for managed namespaces.
pub type NamespaceEventStream = BoxStream<'static, Result<WatchEvent<Namespace>, ClusterError>>;

/// Operations the lifecycle core needs from the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Lists all namespaces carrying the managed label.
    async fn list_managed(&self) -> Result<NamespaceListing, ClusterError>;

    /// Opens a watch over managed namespaces from the given resource
    /// version.
    async fn watch_managed(
        &self,
        resource_version: &str,
    ) -> Result<NamespaceEventStream, ClusterError>;

    /// Fetches a namespace by name, `None` if absent.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError>;

    /// Creates a namespace.
    async fn create_namespace(&self, namespace: Namespace) -> Result<(), ClusterError>;

    /// Deletes a namespace by name.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Creates a service account inside a namespace.
    async fn create_service_account(
        &self,
        namespace: &str,
        account: ServiceAccount,
    ) -> Result<(), ClusterError>;

    /// Creates a role binding inside a namespace.
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: RoleBinding,
    ) -> Result<(), ClusterError>;

    /// Creates a resource quota inside a namespace.
    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: ResourceQuota,
    ) -> Result<(), ClusterError>;

    /// Creates a secret inside a namespace.
    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<(), ClusterError>;

    /// Fetches a secret by name, `None` if absent.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError>;

    /// The API server version, e.g. `v1.30`.
    async fn server_version(&self) -> Result<String, ClusterError>;
}

/// [`ClusterClient`] backed by a real Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    /// Wraps a connected client.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_managed(&self) -> Result<NamespaceListing, ClusterError> {
        let params = ListParams::default().labels(MANAGED_SELECTOR);
        let list = self
            .namespaces()
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube("namespaces", e))?;
        Ok(NamespaceListing {
            resource_version: list.metadata.resource_version.unwrap_or_else(|| "0".into()),
            items: list.items,
        })
    }

    async fn watch_managed(
        &self,
        resource_version: &str,
    ) -> Result<NamespaceEventStream, ClusterError> {
        let params = WatchParams::default().labels(MANAGED_SELECTOR);
        let stream = self
            .namespaces()
            .watch(&params, resource_version)
            .await
            .map_err(|e| ClusterError::from_kube("namespaces", e))?;
        Ok(stream
            .map(|event| event.map_err(|e| ClusterError::Upstream(Box::new(e))))
            .boxed())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        self.namespaces()
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(name, e))
    }

    async fn create_namespace(&self, namespace: Namespace) -> Result<(), ClusterError> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.namespaces()
            .create(&PostParams::default(), &namespace)
            .await
            .map_err(|e| ClusterError::from_kube(&name, e))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.namespaces()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(name, e))?;
        Ok(())
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: ServiceAccount,
    ) -> Result<(), ClusterError> {
        let name = account.metadata.name.clone().unwrap_or_default();
        Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), &account)
            .await
            .map_err(|e| ClusterError::from_kube(&name, e))?;
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: RoleBinding,
    ) -> Result<(), ClusterError> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| ClusterError::from_kube(&name, e))?;
        Ok(())
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: ResourceQuota,
    ) -> Result<(), ClusterError> {
        let name = quota.metadata.name.clone().unwrap_or_default();
        Api::<ResourceQuota>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), &quota)
            .await
            .map_err(|e| ClusterError::from_kube(&name, e))?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<(), ClusterError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| ClusterError::from_kube(&name, e))?;
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(name, e))
    }

    async fn server_version(&self) -> Result<String, ClusterError> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Upstream(Box::new(e)))?;
        Ok(format!("v{}.{}", info.major, info.minor))
    }
}
