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

//! Global resource accounting across tenant namespaces.
//!
//! Tracks the reservation of every live tenant namespace and the aggregate
//! of all reservations, and answers whether a new reservation still fits
//! within the configured global limits.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::quantity::{Quantity, ResourceKind, ResourceVector};

/// A rejected admission: admitting the request would push the aggregate of
/// the named resource over its global limit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "global {resource} limit exceeded: {in_use} in use, {requested} requested, limit is {limit}"
)]
pub struct AdmissionRejection {
    /// The resource whose limit would be exceeded.
    pub resource: ResourceKind,
    /// Aggregate reservation at decision time.
    pub in_use: Quantity,
    /// The requested reservation for that resource.
    pub requested: Quantity,
    /// The configured global limit.
    pub limit: Quantity,
}

#[derive(Default)]
struct Accounts {
    per_namespace: HashMap<String, ResourceVector>,
    aggregate: ResourceVector,
}

/// Thread-safe reservation index.
///
/// The aggregate is the component-wise sum of all per-namespace reservations
/// and never goes negative: a subtraction that would underflow is treated as
/// a tracking inconsistency and the component is zeroed with a warning.
pub struct ResourceAccount {
    limits: ResourceVector,
    inner: RwLock<Accounts>,
}

impl ResourceAccount {
    /// Creates an account with the given global limits. An empty limit
    /// vector disables admission checking entirely.
    pub fn new(limits: ResourceVector) -> Self {
        Self {
            limits,
            inner: RwLock::new(Accounts::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Accounts> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Accounts> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the reservation for a namespace. The old vector
    /// is removed from the aggregate and the new one added in a single
    /// critical section.
    pub fn upsert(&self, namespace: &str, reservation: ResourceVector) {
        let mut accounts = self.write();
        if let Some(old) = accounts.per_namespace.remove(namespace) {
            subtract(&mut accounts.aggregate, namespace, &old);
        }
        accounts.aggregate.merge_add(&reservation);
        accounts
            .per_namespace
            .insert(namespace.to_string(), reservation);
        debug!(namespace = %namespace, aggregate = ?accounts.aggregate, "updated reservation");
    }

    /// Removes the reservation for a namespace, if tracked. Idempotent.
    pub fn remove(&self, namespace: &str) {
        let mut accounts = self.write();
        if let Some(old) = accounts.per_namespace.remove(namespace) {
            subtract(&mut accounts.aggregate, namespace, &old);
            debug!(namespace = %namespace, aggregate = ?accounts.aggregate, "released reservation");
        }
    }

    /// Checks whether a new reservation fits under the global limits: for
    /// every limited resource, the current aggregate plus the requested
    /// amount must not exceed the limit. Resources without a configured
    /// limit are not checked; empty limits admit everything.
    pub fn would_admit(&self, requested: &ResourceVector) -> Result<(), AdmissionRejection> {
        if self.limits.is_empty() {
            return Ok(());
        }

        let accounts = self.read();
        for (kind, limit) in self.limits.iter() {
            let in_use = accounts
                .aggregate
                .get(kind)
                .unwrap_or_else(Quantity::zero);
            let wanted = requested.get(kind).unwrap_or_else(Quantity::zero);
            if in_use.saturating_add(&wanted) > limit {
                warn!(
                    resource = %kind,
                    in_use = %in_use,
                    requested = %wanted,
                    limit = %limit,
                    "global limit exceeded"
                );
                return Err(AdmissionRejection {
                    resource: kind,
                    in_use,
                    requested: wanted,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Copy of the current aggregate reservation.
    pub fn aggregate(&self) -> ResourceVector {
        self.read().aggregate.clone()
    }

    /// Copy of the configured global limits.
    pub fn limits(&self) -> ResourceVector {
        self.limits.clone()
    }

    /// Names of all tracked namespaces.
    pub fn tracked(&self) -> Vec<String> {
        self.read().per_namespace.keys().cloned().collect()
    }

    /// Number of tracked namespaces.
    pub fn tracked_count(&self) -> usize {
        self.read().per_namespace.len()
    }

    /// Drops every reservation.
    pub fn clear(&self) {
        let mut accounts = self.write();
        accounts.per_namespace.clear();
        accounts.aggregate = ResourceVector::new();
    }
}

/// Subtracts a released reservation from the aggregate. Components that hit
/// zero are removed; a component that would go negative signals a tracking
/// inconsistency and is zeroed with a warning.
fn subtract(aggregate: &mut ResourceVector, namespace: &str, released: &ResourceVector) {
    for (kind, quantity) in released.iter() {
        let Some(current) = aggregate.get(kind) else {
            warn!(
                resource = %kind,
                namespace = %namespace,
                "resource tracking inconsistency: component missing from aggregate"
            );
            continue;
        };
        match current.checked_sub(&quantity) {
            Some(rest) => aggregate.set(kind, rest),
            None => {
                warn!(
                    resource = %kind,
                    namespace = %namespace,
                    "resource tracking inconsistency: aggregate would become negative"
                );
                aggregate.remove(kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn vec_of(parts: &[(ResourceKind, &str)]) -> ResourceVector {
        let mut v = ResourceVector::new();
        for (kind, value) in parts {
            v.set(*kind, q(value));
        }
        v
    }

    #[test]
    fn test_aggregate_is_sum_of_reservations() {
        let account = ResourceAccount::new(ResourceVector::new());
        account.upsert("a", vec_of(&[(ResourceKind::Cpu, "1"), (ResourceKind::Memory, "2Gi")]));
        account.upsert("b", vec_of(&[(ResourceKind::Cpu, "500m")]));

        let aggregate = account.aggregate();
        assert_eq!(aggregate.get(ResourceKind::Cpu), Some(q("1500m")));
        assert_eq!(aggregate.get(ResourceKind::Memory), Some(q("2Gi")));

        account.remove("a");
        assert_eq!(account.aggregate(), vec_of(&[(ResourceKind::Cpu, "500m")]));
    }

    #[test]
    fn test_upsert_replaces_existing_reservation() {
        let account = ResourceAccount::new(ResourceVector::new());
        account.upsert("a", vec_of(&[(ResourceKind::Memory, "4Gi")]));
        account.upsert("a", vec_of(&[(ResourceKind::Memory, "1Gi")]));

        assert_eq!(account.aggregate().get(ResourceKind::Memory), Some(q("1Gi")));
        assert_eq!(account.tracked_count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let account = ResourceAccount::new(ResourceVector::new());
        account.upsert("a", vec_of(&[(ResourceKind::Cpu, "1")]));
        account.remove("a");
        account.remove("a");
        assert!(account.aggregate().is_empty());
        assert_eq!(account.tracked_count(), 0);
    }

    #[test]
    fn test_negative_component_is_zeroed() {
        let mut aggregate = vec_of(&[(ResourceKind::Cpu, "500m"), (ResourceKind::Memory, "2Gi")]);
        let released = vec_of(&[(ResourceKind::Cpu, "1"), (ResourceKind::Memory, "1Gi")]);
        subtract(&mut aggregate, "a", &released);

        // The over-released component is dropped, the consistent one shrinks.
        assert!(aggregate.get(ResourceKind::Cpu).is_none());
        assert_eq!(aggregate.get(ResourceKind::Memory), Some(q("1Gi")));
    }

    #[test]
    fn test_component_reaching_zero_is_removed() {
        let mut aggregate = vec_of(&[(ResourceKind::Cpu, "1")]);
        subtract(&mut aggregate, "a", &vec_of(&[(ResourceKind::Cpu, "1")]));
        assert!(aggregate.is_empty());
    }

    #[test]
    fn test_empty_limits_admit_everything() {
        let account = ResourceAccount::new(ResourceVector::new());
        let huge = vec_of(&[(ResourceKind::Cpu, "1000"), (ResourceKind::Memory, "1Ti")]);
        assert!(account.would_admit(&huge).is_ok());
    }

    #[test]
    fn test_admission_at_exact_boundary_is_allowed() {
        let account = ResourceAccount::new(vec_of(&[(ResourceKind::Cpu, "5")]));
        account.upsert("a", vec_of(&[(ResourceKind::Cpu, "4")]));
        assert!(account
            .would_admit(&vec_of(&[(ResourceKind::Cpu, "1000m")]))
            .is_ok());
    }

    #[test]
    fn test_admission_denial_names_the_resource() {
        let account = ResourceAccount::new(vec_of(&[
            (ResourceKind::Cpu, "5"),
            (ResourceKind::Memory, "10Gi"),
        ]));
        account.upsert("a", vec_of(&[(ResourceKind::Cpu, "4500m")]));

        let rejection = account
            .would_admit(&vec_of(&[(ResourceKind::Cpu, "1")]))
            .unwrap_err();
        assert_eq!(rejection.resource, ResourceKind::Cpu);
        assert_eq!(rejection.in_use, q("4500m"));
        assert_eq!(rejection.limit, q("5"));
    }

    #[test]
    fn test_unlimited_resource_does_not_deny() {
        let account = ResourceAccount::new(vec_of(&[(ResourceKind::Cpu, "5")]));
        let request = vec_of(&[(ResourceKind::Cpu, "1"), (ResourceKind::Storage, "100Ti")]);
        assert!(account.would_admit(&request).is_ok());
    }

    #[test]
    fn test_admission_then_upsert_stays_within_limits() {
        let limits = vec_of(&[(ResourceKind::Cpu, "5"), (ResourceKind::Memory, "10Gi")]);
        let account = ResourceAccount::new(limits.clone());

        let request = vec_of(&[(ResourceKind::Cpu, "2"), (ResourceKind::Memory, "4Gi")]);
        for name in ["a", "b"] {
            if account.would_admit(&request).is_ok() {
                account.upsert(name, request.clone());
            }
        }

        let aggregate = account.aggregate();
        for (kind, limit) in limits.iter() {
            let used = aggregate.get(kind).unwrap_or_else(Quantity::zero);
            assert!(used <= limit);
        }
    }

    #[test]
    fn test_clear_resets_everything() {
        let account = ResourceAccount::new(ResourceVector::new());
        account.upsert("a", vec_of(&[(ResourceKind::Cpu, "1")]));
        account.clear();
        assert!(account.aggregate().is_empty());
        assert!(account.tracked().is_empty());
    }
}
