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

//! Event-driven lifecycle tracking of managed namespaces.
//!
//! The watcher mirrors the cluster's set of managed namespaces into the
//! expiration scheduler and the resource account. It first reconciles from
//! a full list, then consumes the watch stream; on stream failure it
//! reconnects with bounded exponential backoff, reconciling again to close
//! any gap.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::core::WatchEvent;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accounting::ResourceAccount;
use crate::cluster::{
    reservation_label, ClusterClient, ClusterError, DURATION_LABEL, SYSTEM_NAMESPACE,
};
use crate::quantity::{Quantity, ResourceKind, ResourceVector};
use crate::scheduler::ExpirationScheduler;

/// Timeout for the cluster delete issued when a lifetime expires.
const DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial delay before re-establishing a failed watch.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Mirrors managed namespaces into expiration timers and reservations.
pub struct NamespaceWatcher {
    client: Arc<dyn ClusterClient>,
    prefix: String,
    scheduler: ExpirationScheduler,
    account: Arc<ResourceAccount>,
    shutdown: CancellationToken,
}

impl NamespaceWatcher {
    /// Creates a watcher over namespaces starting with `prefix`.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        prefix: impl Into<String>,
        scheduler: ExpirationScheduler,
        account: Arc<ResourceAccount>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            scheduler,
            account,
            shutdown: CancellationToken::new(),
        }
    }

    /// Reconciles from the current cluster state, then launches the
    /// streaming loop in the background. Returns once reconciliation has
    /// completed or failed; a failure is logged and retried by the loop.
    pub async fn start(self: Arc<Self>) {
        info!(prefix = %self.prefix, "starting namespace watcher");

        let initial = match self.reconcile().await {
            Ok(resource_version) => Some(resource_version),
            Err(e) => {
                error!(error = %e, "initial reconciliation failed");
                None
            }
        };

        let watcher = Arc::clone(&self);
        tokio::spawn(async move {
            watcher.stream_loop(initial).await;
        });
    }

    /// Stops the streaming loop, cancels all timers and clears the
    /// resource account. Idempotent.
    pub fn stop(&self) {
        info!("stopping namespace watcher");
        self.shutdown.cancel();
        self.scheduler.stop_all();
        self.account.clear();
    }

    /// Lists managed namespaces, replays each as if freshly added, and
    /// drops tracked state for namespaces that no longer exist. Returns
    /// the resource version the watch should start from.
    pub async fn reconcile(&self) -> Result<String, ClusterError> {
        let listing = self.client.list_managed().await?;
        debug!(count = listing.items.len(), "reconciling namespaces");

        let live: HashSet<&str> = listing
            .items
            .iter()
            .filter(|ns| self.should_process(ns))
            .filter_map(|ns| ns.metadata.name.as_deref())
            .collect();

        for stale in self
            .account
            .tracked()
            .into_iter()
            .filter(|name| !live.contains(name.as_str()))
        {
            debug!(namespace = %stale, "dropping state for vanished namespace");
            self.forget(&stale);
        }

        for namespace in &listing.items {
            if self.should_process(namespace) {
                self.observe(namespace);
            }
        }

        Ok(listing.resource_version)
    }

    async fn stream_loop(self: Arc<Self>, initial_resource_version: Option<String>) {
        let mut pending = initial_resource_version;
        let mut backoff = BACKOFF_BASE;

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let resource_version = match pending.take() {
                Some(rv) => rv,
                None => match self.reconcile().await {
                    Ok(rv) => rv,
                    Err(e) => {
                        error!(error = %e, "reconciliation failed");
                        if !self.wait_backoff(&mut backoff).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            let mut stream = match self.client.watch_managed(&resource_version).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to open namespace watch");
                    if !self.wait_backoff(&mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            info!(resource_version = %resource_version, "namespace watch established");
            backoff = BACKOFF_BASE;

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    event = stream.next() => match event {
                        None => {
                            warn!("namespace watch stream closed");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "namespace watch stream failed");
                            break;
                        }
                        Some(Ok(event)) => {
                            if !self.handle_event(event) {
                                break;
                            }
                        }
                    }
                }
            }

            if !self.wait_backoff(&mut backoff).await {
                return;
            }
        }
    }

    /// Sleeps for the current backoff, doubling it up to the cap. Returns
    /// false if shutdown was requested while waiting.
    async fn wait_backoff(&self, backoff: &mut Duration) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(BACKOFF_CAP);
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Applies a single watch event. Returns false when the stream must be
    /// abandoned and state rebuilt from a fresh list.
    fn handle_event(&self, event: WatchEvent<Namespace>) -> bool {
        match event {
            WatchEvent::Added(namespace) => {
                if self.should_process(&namespace) {
                    self.observe(&namespace);
                }
            }
            WatchEvent::Modified(namespace) => {
                if self.should_process(&namespace) {
                    self.observe(&namespace);
                } else if let Some(name) = namespace.metadata.name.as_deref() {
                    self.forget(name);
                }
            }
            WatchEvent::Deleted(namespace) => {
                if let Some(name) = namespace.metadata.name.as_deref() {
                    self.forget(name);
                }
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(response) => {
                warn!(code = response.code, message = %response.message, "namespace watch error event");
                // 410 Gone: the resource version expired, only a re-list helps.
                if response.code == 410 {
                    return false;
                }
            }
        }
        true
    }

    /// Whether lifecycle management applies to this namespace: it is not
    /// the control plane's own namespace, carries the managed prefix, and
    /// declares a lifetime.
    pub fn should_process(&self, namespace: &Namespace) -> bool {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return false;
        };
        if name == SYSTEM_NAMESPACE {
            return false;
        }
        if !name.starts_with(&self.prefix) {
            return false;
        }
        labels(namespace).is_some_and(|l| l.contains_key(DURATION_LABEL))
    }

    /// Records the namespace's reservation and (re)schedules its expiration
    /// timer. A lifetime that has already elapsed deletes immediately.
    fn observe(&self, namespace: &Namespace) {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return;
        };
        let Some(duration_value) = labels(namespace).and_then(|l| l.get(DURATION_LABEL)) else {
            return;
        };
        let duration = match humantime::parse_duration(duration_value) {
            Ok(duration) => duration,
            Err(e) => {
                warn!(namespace = %name, value = %duration_value, error = %e, "unparseable duration label, skipping");
                return;
            }
        };

        self.account.upsert(name, extract_reservation(namespace));

        let age = namespace
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(|t| Utc::now().signed_duration_since(t.0).to_std().ok())
            .unwrap_or_default();
        let remaining = duration.saturating_sub(age);
        if remaining.is_zero() {
            info!(namespace = %name, "namespace already expired");
        } else {
            debug!(namespace = %name, remaining = %humantime::format_duration(remaining), "scheduling cleanup");
        }

        let client = Arc::clone(&self.client);
        let target = name.to_string();
        self.scheduler
            .schedule(name, Instant::now() + remaining, move || async move {
                reclaim(client, target).await;
            });
    }

    /// Drops the timer and reservation for a namespace.
    fn forget(&self, name: &str) {
        self.scheduler.cancel(name);
        self.account.remove(name);
    }
}

/// Deletes a namespace whose lifetime has expired.
async fn reclaim(client: Arc<dyn ClusterClient>, name: String) {
    info!(namespace = %name, "namespace lifetime expired, deleting");
    match tokio::time::timeout(DELETE_TIMEOUT, client.delete_namespace(&name)).await {
        Ok(Ok(())) => info!(namespace = %name, "deleted expired namespace"),
        Ok(Err(ClusterError::NotFound(_))) => {
            debug!(namespace = %name, "expired namespace was already gone")
        }
        Ok(Err(e)) => error!(namespace = %name, error = %e, "failed to delete expired namespace"),
        Err(_) => error!(namespace = %name, "timed out deleting expired namespace"),
    }
}

fn labels(namespace: &Namespace) -> Option<&BTreeMap<String, String>> {
    namespace.metadata.labels.as_ref()
}

/// Reads the reservation vector from the namespace's resource labels.
/// Labels that fail to parse are skipped with a warning.
fn extract_reservation(namespace: &Namespace) -> ResourceVector {
    let mut reservation = ResourceVector::new();
    let Some(labels) = labels(namespace) else {
        return reservation;
    };
    for kind in ResourceKind::ALL {
        if let Some(value) = labels.get(reservation_label(kind)) {
            match Quantity::parse(value) {
                Ok(quantity) => reservation.set(kind, quantity),
                Err(e) => {
                    warn!(
                        namespace = ?namespace.metadata.name,
                        resource = %kind,
                        value = %value,
                        error = %e,
                        "unparseable resource label, skipping"
                    );
                }
            }
        }
    }
    reservation
}
