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

//! Configuration structures for the tenama service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quantity::{Quantity, QuantityParseError, ResourceKind, ResourceVector};

/// Errors detected while validating a loaded configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The namespace prefix is required for name construction and the
    /// watch scope.
    #[error("namespace.prefix must not be empty")]
    MissingPrefix,

    /// A quantity string in the configuration failed to parse.
    #[error("invalid quantity in {field}: {source}")]
    InvalidQuantity {
        /// Dotted path of the offending field.
        field: String,
        #[source]
        source: QuantityParseError,
    },
}

/// Main configuration for the tenama service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Log level: debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Cluster-wide ceiling on the sum of all tenant reservations.
    #[serde(default)]
    pub global_limits: GlobalLimits,

    /// Cluster connection details used when crafting tenant kubeconfigs.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Defaults applied to namespace requests.
    #[serde(default)]
    pub namespace: NamespaceDefaults,

    /// Credentials accepted on the namespace endpoints.
    #[serde(default)]
    pub basic_auth: Vec<BasicAuthUser>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            global_limits: GlobalLimits::default(),
            kubernetes: KubernetesConfig::default(),
            namespace: NamespaceDefaults::default(),
            basic_auth: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON lines.
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

/// Cluster-wide resource constraints over all managed namespaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLimits {
    /// Whether admission checking is enabled at all.
    #[serde(default)]
    pub enabled: bool,

    /// The limiting resource block; `requests` is what admission sums.
    #[serde(default)]
    pub resources: ResourceDefaults,
}

/// Cluster connection details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// API server endpoint written into tenant kubeconfigs.
    #[serde(default)]
    pub cluster_endpoint: String,
}

/// Defaults applied when a namespace request omits fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceDefaults {
    /// Prefix every managed namespace name starts with.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Default suffix when the request supplies none.
    #[serde(default)]
    pub suffix: String,

    /// Default lifetime when the request supplies none.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Default resource requests and quota limits.
    #[serde(default)]
    pub resources: ResourceDefaults,
}

impl Default for NamespaceDefaults {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            suffix: String::new(),
            duration: None,
            resources: ResourceDefaults::default(),
        }
    }
}

/// Requests and limits blocks as quantity strings; empty means unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefaults {
    /// Requested resources.
    #[serde(default)]
    pub requests: ResourceRequests,

    /// Resource limits.
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// The `requests` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// CPU request.
    #[serde(default)]
    pub cpu: String,
    /// Memory request.
    #[serde(default)]
    pub memory: String,
    /// Storage request.
    #[serde(default)]
    pub storage: String,
}

impl ResourceRequests {
    /// Returns the configured string for a resource kind, if non-empty.
    pub fn get(&self, kind: ResourceKind) -> Option<&str> {
        let value = match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
            ResourceKind::Storage => &self.storage,
        };
        (!value.is_empty()).then_some(value.as_str())
    }
}

/// The `limits` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit.
    #[serde(default)]
    pub cpu: String,
    /// Memory limit.
    #[serde(default)]
    pub memory: String,
}

/// A username/password pair for HTTP basic authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthUser {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_prefix() -> String {
    "tenama".to_string()
}

impl Config {
    /// Checks the configuration for errors that must abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.prefix.trim().is_empty() {
            return Err(ConfigError::MissingPrefix);
        }
        self.global_limit_vector()?;
        self.default_request_vector()?;
        Ok(())
    }

    /// The admission limits as a resource vector. Empty when global limits
    /// are disabled or no request quantities are configured.
    pub fn global_limit_vector(&self) -> Result<ResourceVector, ConfigError> {
        if !self.global_limits.enabled {
            return Ok(ResourceVector::new());
        }
        requests_vector(
            &self.global_limits.resources.requests,
            "globalLimits.resources.requests",
        )
    }

    /// The per-namespace default reservation from the config file.
    pub fn default_request_vector(&self) -> Result<ResourceVector, ConfigError> {
        requests_vector(
            &self.namespace.resources.requests,
            "namespace.resources.requests",
        )
    }

    /// Hard limits for the per-namespace `ResourceQuota`, as Kubernetes
    /// quota keys. Empty when no quantities are configured.
    pub fn quota_hard_limits(&self) -> Vec<(&'static str, String)> {
        let resources = &self.namespace.resources;
        let mut hard = Vec::new();
        for (key, value) in [
            ("requests.cpu", &resources.requests.cpu),
            ("requests.memory", &resources.requests.memory),
            ("requests.storage", &resources.requests.storage),
            ("limits.cpu", &resources.limits.cpu),
            ("limits.memory", &resources.limits.memory),
        ] {
            if !value.is_empty() {
                hard.push((key, value.clone()));
            }
        }
        hard
    }
}

fn requests_vector(
    requests: &ResourceRequests,
    field_prefix: &str,
) -> Result<ResourceVector, ConfigError> {
    let mut vector = ResourceVector::new();
    for kind in ResourceKind::ALL {
        if let Some(value) = requests.get(kind) {
            let quantity =
                Quantity::parse(value).map_err(|source| ConfigError::InvalidQuantity {
                    field: format!("{field_prefix}.{kind}"),
                    source,
                })?;
            vector.set(kind, quantity);
        }
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
logLevel: debug
logFormat: text
globalLimits:
  enabled: true
  resources:
    requests:
      cpu: "5000m"
      memory: 10Gi
      storage: 50Gi
kubernetes:
  clusterEndpoint: https://kubernetes.example.com:6443
namespace:
  prefix: tenama
  duration: 48h
  resources:
    requests:
      cpu: "1"
      memory: 2Gi
      storage: 5Gi
    limits:
      cpu: "2"
      memory: 4Gi
basicAuth:
  - username: alice
    password: secret
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.namespace.prefix, "tenama");
        assert_eq!(
            config.namespace.duration,
            Some(Duration::from_secs(48 * 3600))
        );
        assert_eq!(config.basic_auth.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_on_empty_config() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.namespace.prefix, "tenama");
        assert!(config.namespace.duration.is_none());
        assert!(config.global_limit_vector().unwrap().is_empty());
    }

    #[test]
    fn test_global_limits_vector_when_enabled() {
        let config: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        let limits = config.global_limit_vector().unwrap();
        assert_eq!(
            limits.get(ResourceKind::Cpu),
            Some(Quantity::parse("5").unwrap())
        );
        assert_eq!(
            limits.get(ResourceKind::Memory),
            Some(Quantity::parse("10Gi").unwrap())
        );
    }

    #[test]
    fn test_disabled_global_limits_yield_empty_vector() {
        let yaml = r#"
globalLimits:
  enabled: false
  resources:
    requests:
      cpu: "5"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.global_limit_vector().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_quantity_is_rejected() {
        let yaml = r#"
globalLimits:
  enabled: true
  resources:
    requests:
      cpu: "not-a-quantity"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_empty_prefix_is_rejected() {
        let yaml = "namespace:\n  prefix: \"\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingPrefix)));
    }

    #[test]
    fn test_quota_hard_limits_skip_unset_fields() {
        let config: Config = serde_yaml::from_str(FULL_CONFIG).unwrap();
        let hard = config.quota_hard_limits();
        assert_eq!(hard.len(), 5);
        assert!(hard.contains(&("limits.cpu", "2".to_string())));

        let empty: Config = serde_yaml::from_str("{}").unwrap();
        assert!(empty.quota_hard_limits().is_empty());
    }
}
