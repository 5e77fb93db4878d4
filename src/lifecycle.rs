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

//! Lifecycle orchestration of tenant namespaces.
//!
//! [`NamespaceManager`] is the public entry point: it validates and admits
//! namespace requests, creates the namespace with its auxiliary objects,
//! proxies reads and deletes, and owns the watcher that reclaims expired
//! namespaces.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Namespace, ResourceQuota, ResourceQuotaSpec, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use kube::core::ObjectMeta;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::accounting::ResourceAccount;
use crate::cluster::{
    reservation_label, ClusterClient, ClusterError, CREATED_BY_LABEL, CREATED_BY_VALUE,
    DURATION_LABEL, SYSTEM_NAMESPACE,
};
use crate::config::{Config, ConfigError};
use crate::error::ApiError;
use crate::kubeconfig;
use crate::names::{self, GENERATED_SUFFIX_LEN};
use crate::quantity::{Quantity, ResourceKind, ResourceVector};
use crate::scheduler::ExpirationScheduler;
use crate::watcher::NamespaceWatcher;

/// ClusterRole granted to the users listed in a namespace request.
const USER_ROLE: &str = "edit";

/// ClusterRole granted to the control plane's own service account.
const CONTROL_PLANE_ROLE: &str = "admin";

/// Service account the control plane itself runs as.
const CONTROL_PLANE_ACCOUNT: &str = "tenama";

/// How long to wait for the token controller to populate the secret.
const TOKEN_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the token secret.
const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A namespace creation request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNamespaceRequest {
    /// Mandatory middle segment of the namespace name.
    #[serde(default)]
    pub infix: String,

    /// Optional name suffix; generated when absent.
    #[serde(default)]
    pub suffix: String,

    /// Requested lifetime, e.g. `30s`, `5m` or `168h`.
    #[serde(default)]
    pub duration: String,

    /// Principals granted edit access inside the namespace.
    #[serde(default)]
    pub users: Vec<String>,

    /// Optional resource reservation.
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
}

/// Requested resources as quantity strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceRequest {
    /// CPU request.
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory request.
    #[serde(default)]
    pub memory: Option<String>,
    /// Storage request.
    #[serde(default)]
    pub storage: Option<String>,
}

impl ResourceRequest {
    fn get(&self, kind: ResourceKind) -> Option<&str> {
        let value = match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
            ResourceKind::Storage => &self.storage,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }
}

/// Result of a successful namespace creation.
#[derive(Debug, Clone)]
pub struct CreatedNamespace {
    /// Canonical name of the created namespace.
    pub name: String,
    /// Kubeconfig YAML granting access to it.
    pub kubeconfig: String,
}

/// Public entry point composing admission, naming, the cluster client and
/// the lifecycle watcher.
pub struct NamespaceManager {
    client: Arc<dyn ClusterClient>,
    config: Arc<Config>,
    account: Arc<ResourceAccount>,
    scheduler: ExpirationScheduler,
    watcher: Arc<NamespaceWatcher>,
}

impl NamespaceManager {
    /// Builds a manager from a validated configuration.
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<Config>) -> Result<Self, ConfigError> {
        let account = Arc::new(ResourceAccount::new(config.global_limit_vector()?));
        let scheduler = ExpirationScheduler::new();
        let watcher = Arc::new(NamespaceWatcher::new(
            Arc::clone(&client),
            config.namespace.prefix.clone(),
            scheduler.clone(),
            Arc::clone(&account),
        ));
        Ok(Self {
            client,
            config,
            account,
            scheduler,
            watcher,
        })
    }

    /// Reconciles state from the cluster and starts the watch loop.
    pub async fn start(&self) {
        Arc::clone(&self.watcher).start().await;
    }

    /// Stops the watch loop, cancels all timers and clears the account.
    /// Idempotent.
    pub fn stop(&self) {
        self.watcher.stop();
    }

    /// Current aggregate reservation, for telemetry.
    pub fn usage(&self) -> ResourceVector {
        self.account.aggregate()
    }

    /// Configured global limits, for telemetry.
    pub fn limits(&self) -> ResourceVector {
        self.account.limits()
    }

    /// Number of namespaces with a pending expiration timer.
    pub fn active_timers(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Validates, admits and creates a namespace with its service account,
    /// role bindings, quota and access kubeconfig.
    pub async fn create_namespace(
        &self,
        request: CreateNamespaceRequest,
    ) -> Result<CreatedNamespace, ApiError> {
        let prefix = &self.config.namespace.prefix;

        let infix = request.infix.trim();
        if infix.is_empty() {
            return Err(ApiError::BadInput("infix must not be empty".into()));
        }

        let duration = self.resolve_duration(&request)?;
        let duration_label = duration_label_value(duration);
        let reservation = self.resolve_reservation(&request)?;

        let suffix = if !request.suffix.is_empty() {
            request.suffix.clone()
        } else if !self.config.namespace.suffix.is_empty() {
            self.config.namespace.suffix.clone()
        } else {
            names::random_suffix(GENERATED_SUFFIX_LEN)
        };

        let name = names::canonicalize(&[prefix, infix, &suffix])
            .map_err(|e| ApiError::BadInput(e.to_string()))?;

        if self.client.get_namespace(&name).await?.is_some() {
            return Err(ApiError::Conflict(name));
        }

        self.account.would_admit(&reservation)?;

        let pod_security_version = match self.client.server_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "could not determine server version");
                "latest".to_string()
            }
        };

        info!(namespace = %name, duration = %duration_label, "creating namespace");
        self.client
            .create_namespace(namespace_object(
                &name,
                &duration_label,
                &reservation,
                &pod_security_version,
            ))
            .await
            .map_err(|e| match e {
                ClusterError::AlreadyExists(_) => ApiError::Conflict(name.clone()),
                other => other.into(),
            })?;

        self.client
            .create_role_binding(&name, control_plane_role_binding(&name))
            .await?;

        let hard = self.config.quota_hard_limits();
        if !hard.is_empty() {
            self.client
                .create_resource_quota(&name, quota_object(prefix, &name, hard))
                .await?;
        }

        let account_name = format!("{prefix}-sa");
        self.client
            .create_service_account(&name, service_account_object(&account_name, &name))
            .await?;
        self.client
            .create_role_binding(
                &name,
                user_role_binding(&name, &request.users, &account_name),
            )
            .await?;

        let secret_name = format!("{account_name}-token");
        self.client
            .create_secret(&name, token_secret_object(&secret_name, &account_name, &name))
            .await?;
        let secret = self.wait_for_token_secret(&name, &secret_name).await?;

        let kubeconfig = kubeconfig::render(
            &self.config.kubernetes.cluster_endpoint,
            &name,
            &account_name,
            &secret,
        )
        .map_err(|e| ApiError::Upstream(Box::new(e)))?;

        info!(namespace = %name, "namespace created");
        Ok(CreatedNamespace { name, kubeconfig })
    }

    /// Deletes a managed namespace. Names outside the managed prefix are
    /// reported as not found. Accounting is released by the ensuing
    /// Deleted watch event, not here.
    pub async fn delete_namespace(&self, name: &str) -> Result<(), ApiError> {
        self.ensure_managed_name(name)?;
        info!(namespace = %name, "deleting namespace on request");
        self.client.delete_namespace(name).await?;
        Ok(())
    }

    /// Fetches a managed namespace by name.
    pub async fn get_namespace(&self, name: &str) -> Result<Namespace, ApiError> {
        self.ensure_managed_name(name)?;
        self.client
            .get_namespace(name)
            .await?
            .ok_or_else(|| ApiError::NotFound(name.to_string()))
    }

    /// Lists the names of all managed namespaces.
    pub async fn list_namespaces(&self) -> Result<Vec<String>, ApiError> {
        let listing = self.client.list_managed().await?;
        Ok(listing
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    fn ensure_managed_name(&self, name: &str) -> Result<(), ApiError> {
        if !name.starts_with(&self.config.namespace.prefix) {
            return Err(ApiError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn resolve_duration(&self, request: &CreateNamespaceRequest) -> Result<Duration, ApiError> {
        let requested = request.duration.trim();
        if !requested.is_empty() {
            return humantime::parse_duration(requested)
                .map_err(|e| ApiError::BadInput(format!("invalid duration {requested:?}: {e}")));
        }
        self.config
            .namespace
            .duration
            .ok_or_else(|| ApiError::BadInput("duration must not be empty".into()))
    }

    /// The reservation vector for a request, falling back to the configured
    /// per-namespace defaults for absent kinds.
    fn resolve_reservation(
        &self,
        request: &CreateNamespaceRequest,
    ) -> Result<ResourceVector, ApiError> {
        let defaults = &self.config.namespace.resources.requests;
        let mut reservation = ResourceVector::new();
        for kind in ResourceKind::ALL {
            let value = request
                .resources
                .as_ref()
                .and_then(|r| r.get(kind))
                .or_else(|| defaults.get(kind));
            if let Some(value) = value {
                let quantity = Quantity::parse(value).map_err(|e| {
                    ApiError::BadInput(format!("invalid {kind} quantity {value:?}: {e}"))
                })?;
                reservation.set(kind, quantity);
            }
        }
        Ok(reservation)
    }

    async fn wait_for_token_secret(
        &self,
        namespace: &str,
        secret_name: &str,
    ) -> Result<Secret, ApiError> {
        let deadline = Instant::now() + TOKEN_WAIT_TIMEOUT;
        let mut poll = tokio::time::interval(TOKEN_POLL_INTERVAL);
        loop {
            poll.tick().await;
            if let Some(secret) = self.client.get_secret(namespace, secret_name).await? {
                let has_token = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get("token"))
                    .is_some_and(|t| !t.0.is_empty());
                if has_token {
                    return Ok(secret);
                }
            }
            if Instant::now() >= deadline {
                return Err(ApiError::Upstream(
                    "timed out waiting for the service account token".into(),
                ));
            }
        }
    }
}

/// Canonical form of the duration label: compound humantime output with
/// the spaces removed, e.g. `1h30m`. Parses back losslessly.
fn duration_label_value(duration: Duration) -> String {
    humantime::format_duration(duration)
        .to_string()
        .replace(' ', "")
}

fn namespace_object(
    name: &str,
    duration_label: &str,
    reservation: &ResourceVector,
    pod_security_version: &str,
) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert(CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string());
    labels.insert(DURATION_LABEL.to_string(), duration_label.to_string());
    labels.insert(
        "pod-security.kubernetes.io/enforce".to_string(),
        "baseline".to_string(),
    );
    labels.insert(
        "pod-security.kubernetes.io/enforce-version".to_string(),
        pod_security_version.to_string(),
    );
    for (kind, quantity) in reservation.iter() {
        labels.insert(reservation_label(kind).to_string(), quantity.to_string());
    }

    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Grants the control plane's own service account admin rights inside the
/// tenant namespace, so it can manage the auxiliary objects later.
fn control_plane_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some("tenama-admin".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CONTROL_PLANE_ACCOUNT.to_string(),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CONTROL_PLANE_ROLE.to_string(),
        },
    }
}

/// Grants the requested users and the tenant service account edit rights.
fn user_role_binding(namespace: &str, users: &[String], account_name: &str) -> RoleBinding {
    let mut subjects: Vec<Subject> = users
        .iter()
        .map(|user| Subject {
            kind: "User".to_string(),
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            name: user.clone(),
            ..Default::default()
        })
        .collect();
    subjects.push(Subject {
        kind: "ServiceAccount".to_string(),
        name: account_name.to_string(),
        ..Default::default()
    });

    RoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{namespace}-troubleshooters")),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subjects: Some(subjects),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: USER_ROLE.to_string(),
        },
    }
}

fn quota_object(prefix: &str, namespace: &str, hard: Vec<(&'static str, String)>) -> ResourceQuota {
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(format!("{prefix}-quota")),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(
                hard.into_iter()
                    .map(|(key, value)| (key.to_string(), K8sQuantity(value)))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_account_object(account_name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(account_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn token_secret_object(secret_name: &str, account_name: &str, namespace: &str) -> Secret {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "kubernetes.io/service-account.name".to_string(),
        account_name.to_string(),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_label_round_trips() {
        for (duration, expected) in [
            (Duration::from_secs(90), "1m30s"),
            (Duration::from_secs(3600), "1h"),
            (Duration::from_secs(2 * 3600 + 30 * 60), "2h30m"),
            (Duration::from_secs(0), "0s"),
        ] {
            let label = duration_label_value(duration);
            assert_eq!(label, expected);
            assert_eq!(humantime::parse_duration(&label).unwrap(), duration);
        }
    }

    #[test]
    fn test_namespace_object_carries_lifecycle_labels() {
        let reservation = ResourceVector::new()
            .with(ResourceKind::Cpu, Quantity::parse("1").unwrap())
            .with(ResourceKind::Memory, Quantity::parse("2Gi").unwrap());
        let namespace = namespace_object("tenama-x-y", "1h", &reservation, "v1.30");
        let labels = namespace.metadata.labels.unwrap();

        assert_eq!(labels.get("created-by"), Some(&"tenama".to_string()));
        assert_eq!(
            labels.get("tenama/namespace-duration"),
            Some(&"1h".to_string())
        );
        assert_eq!(labels.get("tenama/resource-cpu"), Some(&"1".to_string()));
        assert_eq!(
            labels.get("tenama/resource-memory"),
            Some(&"2Gi".to_string())
        );
        assert_eq!(labels.get("tenama/resource-storage"), None);
        assert_eq!(
            labels.get("pod-security.kubernetes.io/enforce"),
            Some(&"baseline".to_string())
        );
    }

    #[test]
    fn test_user_role_binding_includes_service_account() {
        let users = vec!["mustermann".to_string(), "muster".to_string()];
        let binding = user_role_binding("tenama-x", &users, "tenama-sa");
        let subjects = binding.subjects.unwrap();

        assert_eq!(subjects.len(), 3);
        assert!(subjects
            .iter()
            .any(|s| s.kind == "User" && s.name == "mustermann"));
        assert!(subjects
            .iter()
            .any(|s| s.kind == "ServiceAccount" && s.name == "tenama-sa"));
        assert_eq!(binding.role_ref.name, "edit");
    }

    #[test]
    fn test_control_plane_role_binding_targets_system_account() {
        let binding = control_plane_role_binding("tenama-x");
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].namespace.as_deref(), Some(SYSTEM_NAMESPACE));
        assert_eq!(binding.role_ref.name, "admin");
    }

    #[test]
    fn test_quota_object_maps_hard_limits() {
        let quota = quota_object(
            "tenama",
            "tenama-x",
            vec![
                ("requests.cpu", "1".to_string()),
                ("limits.memory", "4Gi".to_string()),
            ],
        );
        assert_eq!(quota.metadata.name.as_deref(), Some("tenama-quota"));
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard.get("requests.cpu"), Some(&K8sQuantity("1".into())));
        assert_eq!(hard.get("limits.memory"), Some(&K8sQuantity("4Gi".into())));
    }

    #[test]
    fn test_token_secret_object_links_service_account() {
        let secret = token_secret_object("tenama-sa-token", "tenama-sa", "tenama-x");
        assert_eq!(
            secret.type_.as_deref(),
            Some("kubernetes.io/service-account-token")
        );
        assert_eq!(
            secret
                .metadata
                .annotations
                .unwrap()
                .get("kubernetes.io/service-account.name"),
            Some(&"tenama-sa".to_string())
        );
    }
}
