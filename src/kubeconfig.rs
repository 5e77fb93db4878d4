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

//! Tenant kubeconfig generation.
//!
//! Builds the kubeconfig document handed back on namespace creation: the
//! configured cluster endpoint, the service-account token and CA from the
//! token secret, and a context pinned to the new namespace.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use thiserror::Error;

/// Cluster name used inside generated kubeconfigs.
const CLUSTER_NAME: &str = "default";

/// Errors while assembling a tenant kubeconfig.
#[derive(Error, Debug)]
pub enum KubeconfigError {
    /// The token secret is missing a required data key.
    #[error("token secret has no {0:?} data")]
    MissingSecretData(&'static str),

    /// The service-account token is not valid UTF-8.
    #[error("service account token is not valid UTF-8")]
    InvalidToken,

    /// The document failed to serialize.
    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Serialize)]
struct KubeconfigDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Serialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Serialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Serialize)]
struct User {
    token: String,
}

#[derive(Serialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Serialize)]
struct Context {
    cluster: String,
    user: String,
    namespace: String,
}

/// Renders a kubeconfig YAML document granting access to `namespace` via
/// the service-account token secret created for it.
pub fn render(
    cluster_endpoint: &str,
    namespace: &str,
    account_name: &str,
    secret: &Secret,
) -> Result<String, KubeconfigError> {
    let data = secret.data.as_ref();
    let ca = data
        .and_then(|d| d.get("ca.crt"))
        .ok_or(KubeconfigError::MissingSecretData("ca.crt"))?;
    let token = data
        .and_then(|d| d.get("token"))
        .ok_or(KubeconfigError::MissingSecretData("token"))?;
    let token =
        String::from_utf8(token.0.clone()).map_err(|_| KubeconfigError::InvalidToken)?;

    let doc = KubeconfigDoc {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_string(),
            cluster: Cluster {
                server: cluster_endpoint.to_string(),
                certificate_authority_data: BASE64.encode(&ca.0),
            },
        }],
        users: vec![NamedUser {
            name: account_name.to_string(),
            user: User { token },
        }],
        contexts: vec![NamedContext {
            name: account_name.to_string(),
            context: Context {
                cluster: CLUSTER_NAME.to_string(),
                user: account_name.to_string(),
                namespace: namespace.to_string(),
            },
        }],
        current_context: account_name.to_string(),
    };

    Ok(serde_yaml::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn token_secret() -> Secret {
        let mut data = BTreeMap::new();
        data.insert("ca.crt".to_string(), ByteString(b"certificate".to_vec()));
        data.insert("token".to_string(), ByteString(b"sa-token".to_vec()));
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_contains_context_and_token() {
        let yaml = render(
            "https://kubernetes.example.com:6443",
            "tenama-team-abcde",
            "tenama-sa",
            &token_secret(),
        )
        .unwrap();

        assert!(yaml.contains("server: https://kubernetes.example.com:6443"));
        assert!(yaml.contains("namespace: tenama-team-abcde"));
        assert!(yaml.contains("token: sa-token"));
        assert!(yaml.contains("current-context: tenama-sa"));
        assert!(yaml.contains(&BASE64.encode(b"certificate")));
    }

    #[test]
    fn test_missing_data_is_rejected() {
        let empty = Secret::default();
        assert!(matches!(
            render("https://example", "ns", "sa", &empty),
            Err(KubeconfigError::MissingSecretData("ca.crt"))
        ));

        let mut only_ca = token_secret();
        only_ca.data.as_mut().unwrap().remove("token");
        assert!(matches!(
            render("https://example", "ns", "sa", &only_ca),
            Err(KubeconfigError::MissingSecretData("token"))
        ));
    }
}
