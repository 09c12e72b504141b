//! Lookup Query
//!
//! Authorization-aware search over the dataset collection.
//!
//! A request passes through these stages:
//! 1. [`QueryNormalizer`] checks keys against the allow-list and coerces values
//! 2. the identity's permissions are resolved (unknown identities get none)
//! 3. [`PrivilegeInjector`] computes the effective base URI constraint
//! 4. [`compile`] emits a `find` filter or an aggregation pipeline whose first
//!    conjunct or stage is the privilege predicate
//! 5. [`QueryExecutor`] runs it with cancellation and a timeout
//!
//! [`LookupService`] wires the stages together and also answers dependency
//! graph requests over the view that [`DependencyViewBuilder`] materializes.

pub mod compiler;
pub mod dependency;
pub mod executor;
pub mod normalizer;
pub mod privilege;
pub mod service;

pub use compiler::{compile, compile_filter, compile_traversal, CompiledQuery, CompiledTraversal};
pub use dependency::{DependencyViewBuilder, ViewBuildOutcome, ViewBuildStats};
pub use executor::{shape_results, QueryExecutor};
pub use normalizer::QueryNormalizer;
pub use privilege::{BaseUriConstraint, DisjointRequestPolicy, PrivilegeInjector};
pub use service::{open_permission_store, LookupService};

// Re-exported so callers need not depend on tokio-util directly
pub use tokio_util::sync::CancellationToken;
