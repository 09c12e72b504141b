//! Aggregation pipeline evaluation.
//!
//! Stages: `$match`, `$project`, `$sort`, `$skip`, `$limit`, `$count`,
//! `$unwind`, `$graphLookup`. Any other stage fails the whole pipeline.

use crate::matcher::{self, resolve_path, values_equal};
use crate::SortDirection;
use lookup_core::{LookupError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Reads other collections for stages that join (`$graphLookup`).
pub trait CollectionSource {
    fn collection(&self, name: &str) -> Arc<Vec<Value>>;
}

impl<F> CollectionSource for F
where
    F: Fn(&str) -> Arc<Vec<Value>>,
{
    fn collection(&self, name: &str) -> Arc<Vec<Value>> {
        self(name)
    }
}

/// Run `stages` over `documents`.
pub fn evaluate(
    mut documents: Vec<Value>,
    stages: &[Value],
    source: &dyn CollectionSource,
) -> Result<Vec<Value>> {
    for stage in stages {
        let (name, spec) = single_key(stage)?;
        documents = match name {
            "$match" => {
                let mut kept = Vec::with_capacity(documents.len());
                for doc in documents {
                    if matcher::matches(&doc, spec)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => project(documents, spec)?,
            "$sort" => {
                let keys = sort_keys(spec)?;
                sort_documents(&mut documents, &keys);
                documents
            }
            "$skip" => {
                let n = non_negative(name, spec)?;
                documents.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = non_negative(name, spec)?;
                documents.into_iter().take(n).collect()
            }
            "$count" => count(documents, spec)?,
            "$unwind" => unwind(documents, spec)?,
            "$graphLookup" => graph_lookup(documents, spec, source)?,
            other => {
                return Err(LookupError::ExecutionFailure(format!(
                    "unsupported pipeline stage '{}'",
                    other
                )))
            }
        };
    }
    Ok(documents)
}

fn single_key(stage: &Value) -> Result<(&str, &Value)> {
    match stage.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| stage_error("empty pipeline stage")),
        _ => Err(stage_error(
            "a pipeline stage must be a document with exactly one field",
        )),
    }
}

fn stage_error(message: &str) -> LookupError {
    LookupError::ExecutionFailure(message.to_string())
}

fn non_negative(stage: &str, spec: &Value) -> Result<usize> {
    spec.as_u64().map(|n| n as usize).ok_or_else(|| {
        LookupError::ExecutionFailure(format!("{} expects a non-negative integer", stage))
    })
}

fn sort_keys(spec: &Value) -> Result<Vec<(String, SortDirection)>> {
    let map = spec
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| stage_error("$sort expects a non-empty document"))?;

    map.iter()
        .map(|(field, direction)| {
            SortDirection::from_value(direction)
                .map(|d| (field.clone(), d))
                .ok_or_else(|| {
                    LookupError::ExecutionFailure(format!(
                        "$sort direction for '{}' must be 1 or -1",
                        field
                    ))
                })
        })
        .collect()
}

/// Stable sort by the given keys. Missing fields sort as null.
pub fn sort_documents(documents: &mut [Value], keys: &[(String, SortDirection)]) {
    if keys.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        for (field, direction) in keys {
            let left = resolve_path(a, field).into_iter().next();
            let right = resolve_path(b, field).into_iter().next();
            let ordering = match direction {
                SortDirection::Ascending => compare_values(left, right),
                SortDirection::Descending => compare_values(right, left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order across JSON values (null < numbers < strings < objects < arrays < booleans).
pub fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for (x, y) in a.iter().zip(b) {
                let ordering = compare_values(Some(x), Some(y));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                let ordering = ka
                    .cmp(kb)
                    .then_with(|| compare_values(Some(va), Some(vb)));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => Ordering::Equal,
    }
}

fn project(documents: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let fields = spec
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| stage_error("$project expects a non-empty document"))?;

    let mut include_id = true;
    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (field, flag) in fields {
        let keep = match flag {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => {
                return Err(LookupError::ExecutionFailure(format!(
                    "unsupported $project expression for '{}'",
                    field
                )))
            }
        };
        if field == "_id" {
            include_id = keep;
        } else if keep {
            included.push(field.as_str());
        } else {
            excluded.push(field.as_str());
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(stage_error(
            "$project cannot mix inclusion and exclusion",
        ));
    }

    Ok(documents
        .into_iter()
        .map(|doc| {
            if included.is_empty() {
                let mut doc = doc;
                for path in &excluded {
                    remove_path(&mut doc, path);
                }
                if !include_id {
                    remove_path(&mut doc, "_id");
                }
                doc
            } else {
                let mut out = Value::Object(Map::new());
                if include_id {
                    copy_path(&doc, &mut out, "_id");
                }
                for path in &included {
                    copy_path(&doc, &mut out, path);
                }
                out
            }
        })
        .collect())
}

fn copy_path(source: &Value, target: &mut Value, path: &str) {
    let exists = path
        .split('.')
        .try_fold(source, |current, segment| current.get(segment))
        .is_some();
    if exists {
        copy_existing_path(source, target, path);
    }
}

fn copy_existing_path(source: &Value, target: &mut Value, path: &str) {
    let Value::Object(map) = target else {
        return;
    };
    match path.split_once('.') {
        None => {
            if let Some(value) = source.get(path) {
                map.insert(path.to_string(), value.clone());
            }
        }
        Some((head, rest)) => {
            if let Some(child_source) = source.get(head) {
                let child_target = map
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                copy_existing_path(child_source, child_target, rest);
            }
        }
    }
}

fn remove_path(document: &mut Value, path: &str) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = document {
                map.remove(path);
            }
        }
        Some((head, rest)) => {
            if let Some(child) = document.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

fn count(documents: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let field = spec
        .as_str()
        .filter(|f| !f.is_empty() && !f.starts_with('$') && !f.contains('.'))
        .ok_or_else(|| stage_error("$count expects a plain field name"))?;

    // An empty input produces no count document
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Map::new();
    out.insert(field.to_string(), Value::from(documents.len() as u64));
    Ok(vec![Value::Object(out)])
}

fn field_reference(expression: &str) -> Option<&str> {
    expression.strip_prefix('$').filter(|p| !p.is_empty())
}

fn unwind(documents: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let path = spec
        .as_str()
        .and_then(field_reference)
        .ok_or_else(|| stage_error("$unwind expects a '$field' path"))?;

    let mut out = Vec::new();
    for doc in documents {
        let value = resolve_path(&doc, path).into_iter().next().cloned();
        match value {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn set_path(document: &mut Value, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = document {
                map.insert(path.to_string(), value);
            }
        }
        Some((head, rest)) => {
            if let Some(child) = document.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

struct GraphLookup<'a> {
    from: &'a str,
    start_with: &'a Value,
    connect_from: &'a str,
    connect_to: &'a str,
    as_field: &'a str,
    max_depth: Option<u64>,
}

impl<'a> GraphLookup<'a> {
    fn parse(spec: &'a Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| stage_error("$graphLookup expects a document"))?;

        let text = |key: &str| -> Result<&'a str> {
            map.get(key).and_then(Value::as_str).ok_or_else(|| {
                LookupError::ExecutionFailure(format!("$graphLookup requires string '{}'", key))
            })
        };

        let max_depth = match map.get("maxDepth") {
            None => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| {
                stage_error("$graphLookup maxDepth must be a non-negative integer")
            })?),
        };

        Ok(Self {
            from: text("from")?,
            start_with: map
                .get("startWith")
                .ok_or_else(|| stage_error("$graphLookup requires 'startWith'"))?,
            connect_from: text("connectFromField")?,
            connect_to: text("connectToField")?,
            as_field: text("as")?,
            max_depth,
        })
    }
}

/// Values of an expression evaluated against `document`, arrays flattened.
fn expression_values(document: &Value, expression: &Value) -> Vec<Value> {
    match expression.as_str().and_then(field_reference) {
        Some(path) => path_values(document, path),
        None => flatten(vec![expression.clone()]),
    }
}

fn path_values(document: &Value, path: &str) -> Vec<Value> {
    flatten(resolve_path(document, path).into_iter().cloned().collect())
}

fn flatten(values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items),
            Value::Null => {}
            other => out.push(other),
        }
    }
    out
}

fn contains_value(values: &[Value], candidate: &Value) -> bool {
    values.iter().any(|v| values_equal(v, candidate))
}

fn graph_lookup(
    documents: Vec<Value>,
    spec: &Value,
    source: &dyn CollectionSource,
) -> Result<Vec<Value>> {
    let lookup = GraphLookup::parse(spec)?;
    let from = source.collection(lookup.from);

    let mut out = Vec::with_capacity(documents.len());
    for mut doc in documents {
        let mut frontier = expression_values(&doc, lookup.start_with);
        let mut seen_values: Vec<Value> = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut found = Vec::new();
        let mut depth = 0u64;

        while !frontier.is_empty() {
            if lookup.max_depth.map(|max| depth > max).unwrap_or(false) {
                break;
            }
            seen_values.extend(frontier.iter().cloned());

            let mut next = Vec::new();
            for (index, candidate) in from.iter().enumerate() {
                if visited.contains(&index) {
                    continue;
                }
                let connects = resolve_path(candidate, lookup.connect_to)
                    .into_iter()
                    .flat_map(|v| match v {
                        Value::Array(items) => items.iter().collect::<Vec<_>>(),
                        other => vec![other],
                    })
                    .any(|v| contains_value(&frontier, v));
                if !connects {
                    continue;
                }

                visited.insert(index);
                found.push(candidate.clone());
                for value in path_values(candidate, lookup.connect_from) {
                    if !contains_value(&seen_values, &value) && !contains_value(&next, &value) {
                        next.push(value);
                    }
                }
            }

            frontier = next;
            depth += 1;
        }

        if let Value::Object(map) = &mut doc {
            map.insert(lookup.as_field.to_string(), Value::Array(found));
        }
        out.push(doc);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_collections(_: &str) -> Arc<Vec<Value>> {
        Arc::new(Vec::new())
    }

    fn datasets() -> Vec<Value> {
        vec![
            json!({"uuid": "u-1", "base_uri": "s3://a", "size": 3, "tags": ["x", "y"]}),
            json!({"uuid": "u-2", "base_uri": "s3://b", "size": 1, "tags": ["y"]}),
            json!({"uuid": "u-3", "base_uri": "s3://a", "size": 2}),
        ]
    }

    #[test]
    fn test_match_then_count() {
        let out = evaluate(
            datasets(),
            &[json!({"$match": {"base_uri": "s3://a"}}), json!({"$count": "n"})],
            &no_collections,
        )
        .unwrap();
        assert_eq!(out, vec![json!({"n": 2})]);
    }

    #[test]
    fn test_count_of_nothing_is_empty() {
        let out = evaluate(
            datasets(),
            &[json!({"$match": {"base_uri": "gs://none"}}), json!({"$count": "n"})],
            &no_collections,
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sort_skip_limit() {
        let out = evaluate(
            datasets(),
            &[
                json!({"$sort": {"size": -1}}),
                json!({"$skip": 1}),
                json!({"$limit": 1}),
            ],
            &no_collections,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["uuid"], "u-3");
    }

    #[test]
    fn test_project_inclusion_and_exclusion() {
        let out = evaluate(
            datasets(),
            &[json!({"$project": {"uuid": 1, "_id": 0}})],
            &no_collections,
        )
        .unwrap();
        assert_eq!(out[0], json!({"uuid": "u-1"}));

        let out = evaluate(
            datasets(),
            &[json!({"$project": {"tags": 0, "size": 0}})],
            &no_collections,
        )
        .unwrap();
        assert_eq!(out[0], json!({"uuid": "u-1", "base_uri": "s3://a"}));
    }

    #[test]
    fn test_unwind() {
        let out = evaluate(
            datasets(),
            &[json!({"$unwind": "$tags"})],
            &no_collections,
        )
        .unwrap();
        let tags: Vec<_> = out.iter().map(|d| d["tags"].clone()).collect();
        assert_eq!(tags, vec![json!("x"), json!("y"), json!("y")]);
    }

    #[test]
    fn test_graph_lookup_follows_edges() {
        let edges = Arc::new(vec![
            json!({"uuid": "a", "related_uuid": "b"}),
            json!({"uuid": "b", "related_uuid": "a"}),
            json!({"uuid": "b", "related_uuid": "c"}),
            json!({"uuid": "c", "related_uuid": "b"}),
            json!({"uuid": "x", "related_uuid": "y"}),
        ]);
        let source = move |name: &str| {
            if name == "deps" {
                Arc::clone(&edges)
            } else {
                Arc::new(Vec::new())
            }
        };

        let lookup = json!({"$graphLookup": {
            "from": "deps",
            "startWith": "$uuid",
            "connectFromField": "related_uuid",
            "connectToField": "uuid",
            "as": "reachable"
        }});
        let out = evaluate(vec![json!({"uuid": "a"})], &[lookup], &source).unwrap();

        let mut reached: Vec<String> = out[0]["reachable"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["related_uuid"].as_str().unwrap().to_string())
            .collect();
        reached.sort();
        reached.dedup();
        assert_eq!(reached, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_graph_lookup_max_depth() {
        let chain = Arc::new(vec![
            json!({"uuid": "a", "related_uuid": "b"}),
            json!({"uuid": "b", "related_uuid": "c"}),
            json!({"uuid": "c", "related_uuid": "d"}),
        ]);
        let source = move |_: &str| Arc::clone(&chain);

        let lookup = json!({"$graphLookup": {
            "from": "deps",
            "startWith": "$uuid",
            "connectFromField": "related_uuid",
            "connectToField": "uuid",
            "as": "reachable",
            "maxDepth": 0
        }});
        let out = evaluate(vec![json!({"uuid": "a"})], &[lookup], &source).unwrap();
        assert_eq!(out[0]["reachable"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_unsupported_stage() {
        let err = evaluate(
            datasets(),
            &[json!({"$out": "stolen"})],
            &no_collections,
        )
        .unwrap_err();
        assert!(matches!(err, LookupError::ExecutionFailure(_)));
        assert!(err.to_string().contains("$out"));
    }

    #[test]
    fn test_stage_must_have_one_key() {
        let err = evaluate(
            datasets(),
            &[json!({"$skip": 1, "$limit": 1})],
            &no_collections,
        )
        .unwrap_err();
        assert!(matches!(err, LookupError::ExecutionFailure(_)));
    }

    #[test]
    fn test_compare_values_orders_types() {
        assert_eq!(
            compare_values(None, Some(&json!(1))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!("b")), Some(&json!("a"))),
            Ordering::Greater
        );
    }
}
