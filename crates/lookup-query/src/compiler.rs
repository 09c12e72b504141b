//! Compilation of normalized requests into store-native filters and pipelines.
//!
//! Conjunct order is fixed: privilege predicate, free text, membership
//! predicates, and last the client's raw fragment. Requested base URIs are
//! already folded into the privilege predicate by the injector, so they never
//! appear as a second predicate.

use crate::privilege::BaseUriConstraint;
use lookup_core::{QueryKey, QuerySpec};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Membership keys compiled to `$in` predicates, in conjunct order.
const MEMBERSHIP_KEYS: [QueryKey; 3] = [
    QueryKey::CreatorUsernames,
    QueryKey::Uuids,
    QueryKey::Tags,
];

/// Field that collects traversal results in the view pipeline.
pub const REACHABLE_FIELD: &str = "reachable";

/// A compiled request, ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompiledQuery {
    Find { filter: Value },
    Aggregate { pipeline: Vec<Value> },
}

/// Build the filter document for a request.
pub fn compile_filter(constraint: &BaseUriConstraint, spec: &QuerySpec) -> Value {
    let mut conjuncts = Vec::new();

    if let Some(privilege) = constraint.predicate() {
        conjuncts.push(privilege);
    }

    if let Some(text) = spec.free_text.as_deref().filter(|t| !t.trim().is_empty()) {
        conjuncts.push(json!({"$text": {"$search": text}}));
    }

    for key in MEMBERSHIP_KEYS {
        let (Some(field), Some(values)) = (key.document_field(), spec.list(key)) else {
            continue;
        };
        if !values.is_empty() {
            conjuncts.push(json!({ field: {"$in": values} }));
        }
    }

    // A raw fragment is always a separate conjunct, never merged key by key
    if let Some(raw) = &spec.query {
        conjuncts.push(Value::Object(raw.clone()));
        return json!({"$and": conjuncts});
    }

    match conjuncts.len() {
        0 => json!({}),
        1 => conjuncts.remove(0),
        _ => json!({"$and": conjuncts}),
    }
}

/// Compile a request to a `find` filter, or to a pipeline when it carries a
/// raw aggregation.
pub fn compile(constraint: &BaseUriConstraint, spec: &QuerySpec) -> CompiledQuery {
    let filter = compile_filter(constraint, spec);

    match &spec.aggregation {
        Some(stages) => {
            let mut pipeline = Vec::with_capacity(stages.len() + 1);
            pipeline.push(json!({"$match": filter}));
            pipeline.extend(stages.iter().cloned());
            CompiledQuery::Aggregate { pipeline }
        }
        None => CompiledQuery::Find { filter },
    }
}

/// Dependency traversal from one dataset.
///
/// Execution is three steps: the gate filter must match the root dataset in
/// the primary collection, the view pipeline collects every UUID connected to
/// the root, and the fetch filter returns the connected datasets that pass
/// the same privilege predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTraversal {
    pub root_uuid: String,
    pub gate_filter: Value,
    pub view: String,
    pub view_pipeline: Vec<Value>,
    constraint: BaseUriConstraint,
}

impl CompiledTraversal {
    /// Filter for the connected datasets, privilege predicate first.
    pub fn fetch_filter(&self, uuids: &BTreeSet<String>) -> Value {
        let membership = json!({"uuid": {"$in": uuids}});
        match self.constraint.predicate() {
            Some(privilege) => json!({"$and": [privilege, membership]}),
            None => membership,
        }
    }

    /// UUIDs connected to the root according to the view pipeline output,
    /// including the root itself.
    pub fn reachable_uuids(&self, view_output: &[Value]) -> BTreeSet<String> {
        let mut uuids = BTreeSet::new();
        uuids.insert(self.root_uuid.clone());

        for document in view_output {
            let Some(edges) = document.get(REACHABLE_FIELD).and_then(Value::as_array) else {
                continue;
            };
            for edge in edges {
                for field in ["uuid", "related_uuid"] {
                    if let Some(uuid) = edge.get(field).and_then(Value::as_str) {
                        uuids.insert(uuid.to_string());
                    }
                }
            }
        }
        uuids
    }
}

/// Compile a dependency traversal rooted at `root_uuid` over view `view`.
pub fn compile_traversal(
    constraint: &BaseUriConstraint,
    root_uuid: &str,
    view: &str,
) -> CompiledTraversal {
    let root = json!({"uuid": root_uuid});
    let gate_filter = match constraint.predicate() {
        Some(privilege) => json!({"$and": [privilege, root]}),
        None => root.clone(),
    };

    let view_pipeline = vec![
        json!({"$match": root}),
        json!({"$limit": 1}),
        json!({"$graphLookup": {
            "from": view,
            "startWith": "$uuid",
            "connectFromField": "related_uuid",
            "connectToField": "uuid",
            "as": REACHABLE_FIELD,
        }}),
    ];

    CompiledTraversal {
        root_uuid: root_uuid.to_string(),
        gate_filter,
        view: view.to_string(),
        view_pipeline,
        constraint: constraint.clone(),
    }
}
