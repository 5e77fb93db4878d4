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

//! tenama - temporary namespace manager for Kubernetes
//!
//! This library provides the building blocks of a service that hands out
//! short-lived, quota-bounded tenant namespaces:
//! - Resource quantity arithmetic and the global reservation account
//! - Per-namespace expiration timers
//! - The watch consumer that mirrors cluster state and reclaims expired
//!   namespaces
//! - The lifecycle orchestrator and its HTTP API

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accounting;
pub mod cluster;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod lifecycle;
pub mod names;
pub mod quantity;
pub mod scheduler;
pub mod server;
pub mod watcher;

// Re-export commonly used types
pub use accounting::ResourceAccount;
pub use cluster::{ClusterClient, KubeClusterClient};
pub use config::Config;
pub use error::ApiError;
pub use lifecycle::{CreateNamespaceRequest, NamespaceManager};
pub use quantity::{Quantity, ResourceKind, ResourceVector};
pub use scheduler::ExpirationScheduler;
pub use server::{ApiServer, BuildInfo};
pub use watcher::NamespaceWatcher;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the service.
pub const SERVICE_NAME: &str = "tenama";
