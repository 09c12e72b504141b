//! Effective base URI constraints.
//!
//! The constraint computed here becomes the mandatory `base_uri` predicate
//! that precedes every other conjunct or pipeline stage.

use lookup_core::{Capability, QuerySpec, ResolvedPermissions};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

/// Base URIs a request may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseUriConstraint {
    /// Admin without requested base URIs: no predicate at all
    Unrestricted,
    /// Only documents whose `base_uri` is in the set
    Restricted(BTreeSet<String>),
}

impl BaseUriConstraint {
    /// True when nothing can match.
    pub fn is_empty(&self) -> bool {
        matches!(self, BaseUriConstraint::Restricted(uris) if uris.is_empty())
    }

    pub fn allows(&self, base_uri: &str) -> bool {
        match self {
            BaseUriConstraint::Unrestricted => true,
            BaseUriConstraint::Restricted(uris) => uris.contains(base_uri),
        }
    }

    /// The `base_uri ∈ effective` predicate, absent when unrestricted.
    pub fn predicate(&self) -> Option<Value> {
        match self {
            BaseUriConstraint::Unrestricted => None,
            BaseUriConstraint::Restricted(uris) => Some(json!({"base_uri": {"$in": uris}})),
        }
    }
}

/// Behavior when a request names only base URIs the identity may not use.
///
/// The identity gets an empty result, exactly as if the base URIs held no
/// matching datasets, so restricted base URIs cannot be probed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisjointRequestPolicy {
    #[default]
    SilentEmpty,
}

/// Computes effective base URI constraints from resolved permissions.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeInjector {
    policy: DisjointRequestPolicy,
}

impl PrivilegeInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(&self) -> DisjointRequestPolicy {
        self.policy
    }

    /// Constraint for searching.
    pub fn search_constraint(
        &self,
        permissions: &ResolvedPermissions,
        spec: &QuerySpec,
    ) -> BaseUriConstraint {
        self.constraint(permissions, Capability::Search, spec.requested_base_uris())
    }

    /// Constraint for registering, from the register relation.
    pub fn register_constraint(
        &self,
        permissions: &ResolvedPermissions,
        spec: &QuerySpec,
    ) -> BaseUriConstraint {
        self.constraint(permissions, Capability::Register, spec.requested_base_uris())
    }

    /// Whether the identity may register datasets under `base_uri`.
    pub fn can_register(&self, permissions: &ResolvedPermissions, base_uri: &str) -> bool {
        permissions.is_admin || permissions.register_base_uris.contains(base_uri)
    }

    fn constraint(
        &self,
        permissions: &ResolvedPermissions,
        capability: Capability,
        requested: Option<&[String]>,
    ) -> BaseUriConstraint {
        let requested: Option<BTreeSet<String>> =
            requested.map(|uris| uris.iter().cloned().collect());

        let constraint = match (permissions.is_admin, requested) {
            (true, None) => BaseUriConstraint::Unrestricted,
            (true, Some(requested)) => BaseUriConstraint::Restricted(requested),
            (false, None) => {
                BaseUriConstraint::Restricted(permissions.base_uris(capability).clone())
            }
            (false, Some(requested)) => BaseUriConstraint::Restricted(
                permissions
                    .base_uris(capability)
                    .intersection(&requested)
                    .cloned()
                    .collect(),
            ),
        };

        if constraint.is_empty() {
            match self.policy {
                DisjointRequestPolicy::SilentEmpty => debug!(
                    username = %permissions.username,
                    capability = %capability,
                    "No permitted base URIs, request yields an empty result"
                ),
            }
        }
        constraint
    }
}
