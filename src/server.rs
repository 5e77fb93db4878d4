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

//! HTTP API server.
//!
//! Serves the namespace endpoints behind basic authentication, plus the
//! unauthenticated info, probe and documentation endpoints.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BasicAuthUser, Config};
use crate::error::ApiError;
use crate::lifecycle::{CreateNamespaceRequest, NamespaceManager};

/// How long in-flight connections may drain after shutdown is requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default location of the static API documentation.
const DOCS_DIR: &str = "web/docs";

/// Build metadata reported by the info endpoint. Initialised once in main
/// and injected, never read from globals.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    /// Crate version.
    pub version: &'static str,
    /// Build timestamp, if stamped into the binary.
    pub build_date: &'static str,
    /// VCS commit, if stamped into the binary.
    pub commit: &'static str,
}

impl BuildInfo {
    /// Metadata captured at compile time.
    pub fn from_build_env() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            build_date: option_env!("TENAMA_BUILD_DATE").unwrap_or("unknown"),
            commit: option_env!("TENAMA_COMMIT").unwrap_or("unknown"),
        }
    }
}

struct ServerState {
    manager: Arc<NamespaceManager>,
    users: Vec<BasicAuthUser>,
    build: BuildInfo,
    docs_dir: PathBuf,
}

/// The HTTP API server.
pub struct ApiServer {
    state: Arc<ServerState>,
    bind_address: String,
    bind_port: u16,
}

impl ApiServer {
    /// Creates a server for the given manager and configuration.
    pub fn new(
        manager: Arc<NamespaceManager>,
        config: &Config,
        build: BuildInfo,
        bind_address: String,
        bind_port: u16,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                manager,
                users: config.basic_auth.clone(),
                build,
                docs_dir: PathBuf::from(DOCS_DIR),
            }),
            bind_address,
            bind_port,
        }
    }

    /// Accepts connections until `shutdown` fires, then drains in-flight
    /// connections for up to five seconds.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(address = %addr, "api server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);
                    connections.spawn(async move {
                        let service = service_fn(move |req| handle(Arc::clone(&state), req));
                        let http = hyper::server::conn::http1::Builder::new();
                        if let Err(e) = http.serve_connection(io, service).await {
                            debug!(error = %e, "connection terminated");
                        }
                    });
                }
            }
        }

        info!("draining api connections");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while !connections.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    connections = connections.len(),
                    "shutdown timeout reached, aborting connections"
                );
                connections.abort_all();
                break;
            }
            tokio::select! {
                _ = connections.join_next() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        Ok(())
    }
}

async fn handle(
    state: Arc<ServerState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == "/namespace" || path.starts_with("/namespace/") {
        if !check_basic_auth(&state.users, req.headers()) {
            return Ok(unauthorized_response());
        }
        return handle_namespace(state, method, &path, req).await;
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/healthz") | (Method::GET, "/readiness") => {
            text_response(StatusCode::OK, "OK")
        }
        (Method::GET, "/info") => info_response(&state),
        (Method::GET, p) if p == "/docs" || p.starts_with("/docs/") => {
            serve_docs(&state.docs_dir, p).await
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn handle_namespace(
    state: Arc<ServerState>,
    method: Method,
    path: &str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let name = path
        .strip_prefix("/namespace")
        .map(|rest| rest.trim_matches('/').to_string())
        .unwrap_or_default();

    let response = match (method, name.is_empty()) {
        (Method::POST, true) => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<CreateNamespaceRequest>(&body) {
                Ok(request) => match state.manager.create_namespace(request).await {
                    Ok(created) => json_response(
                        StatusCode::OK,
                        &NamespaceResponse {
                            message: "namespace created".into(),
                            namespace: Some(created.name),
                            kubeconfig: Some(created.kubeconfig),
                        },
                    ),
                    Err(e) => error_response(&e, None),
                },
                Err(e) => error_response(
                    &ApiError::BadInput(format!("invalid request body: {e}")),
                    None,
                ),
            }
        }
        (Method::GET, true) => match state.manager.list_namespaces().await {
            Ok(namespaces) => json_response(
                StatusCode::OK,
                &NamespaceListResponse {
                    message: "namespaces retrieved".into(),
                    namespaces,
                },
            ),
            Err(e) => error_response(&e, None),
        },
        (Method::GET, false) => match state.manager.get_namespace(&name).await {
            Ok(namespace) => json_response(
                StatusCode::OK,
                &NamespaceResponse {
                    message: "namespace found".into(),
                    namespace: namespace.metadata.name,
                    kubeconfig: None,
                },
            ),
            Err(e) => error_response(&e, Some(&name)),
        },
        (Method::DELETE, false) => match state.manager.delete_namespace(&name).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &NamespaceResponse {
                    message: "namespace deleted".into(),
                    namespace: Some(name),
                    kubeconfig: None,
                },
            ),
            Err(e) => error_response(&e, Some(&name)),
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

#[derive(Serialize)]
struct NamespaceResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kubeconfig: Option<String>,
}

#[derive(Serialize)]
struct NamespaceListResponse {
    message: String,
    namespaces: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    version: &'static str,
    build_date: &'static str,
    commit: &'static str,
    global_limits: GlobalLimitsStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalLimitsStatus {
    enabled: bool,
    current_usage: BTreeMap<String, String>,
    limits: BTreeMap<String, String>,
}

fn info_response(state: &ServerState) -> Response<Full<Bytes>> {
    let limits = state.manager.limits();
    let usage = state.manager.usage();
    let to_strings = |vector: &crate::quantity::ResourceVector| {
        vector
            .iter()
            .map(|(kind, quantity)| (kind.to_string(), quantity.to_string()))
            .collect::<BTreeMap<_, _>>()
    };
    json_response(
        StatusCode::OK,
        &InfoResponse {
            version: state.build.version,
            build_date: state.build.build_date,
            commit: state.build.commit,
            global_limits: GlobalLimitsStatus {
                enabled: !limits.is_empty(),
                current_usage: to_strings(&usage),
                limits: to_strings(&limits),
            },
        },
    )
}

/// Validates the basic-auth header against the configured user list with
/// constant-time comparisons.
fn check_basic_auth(users: &[BasicAuthUser], headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return false;
    };

    let mut authorized = false;
    for user in users {
        let user_match = user.username.as_bytes().ct_eq(username.as_bytes());
        let password_match = user.password.as_bytes().ct_eq(password.as_bytes());
        authorized |= bool::from(user_match & password_match);
    }
    authorized
}

fn unauthorized_response() -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&NamespaceResponse {
        message: "authentication required".into(),
        namespace: None,
        kubeconfig: None,
    })
    .unwrap_or_default();
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, "Basic realm=\"tenama\"")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn error_response(err: &ApiError, namespace: Option<&str>) -> Response<Full<Bytes>> {
    if err.status() == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "request failed");
    }
    json_response(
        err.status(),
        &NamespaceResponse {
            message: err.to_string(),
            namespace: namespace.map(str::to_string),
            kubeconfig: None,
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn serve_docs(docs_dir: &std::path::Path, path: &str) -> Response<Full<Bytes>> {
    let Some(relative) = sanitize_docs_path(path) else {
        return text_response(StatusCode::NOT_FOUND, "not found");
    };
    match tokio::fs::read(docs_dir.join(&relative)).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type_for(&relative))
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Maps a `/docs` request path to a safe relative file path, rejecting
/// traversal segments.
fn sanitize_docs_path(path: &str) -> Option<String> {
    let relative = path.strip_prefix("/docs")?.trim_matches('/');
    if relative.is_empty() {
        return Some("index.html".to_string());
    }
    if relative
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return None;
    }
    Some(relative.to_string())
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
