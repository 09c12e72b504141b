//! MongoDB-style filter evaluation over JSON documents.
//!
//! Supported:
//! - logical: `$and`, `$or`, `$nor`
//! - text: `$text: {"$search": "..."}`, case-insensitive, any term matches
//! - field conditions: `$eq`, `$ne`, `$in`, `$nin`, `$all`, `$exists`,
//!   `$gt`, `$gte`, `$lt`, `$lte`, implicit equality
//!
//! Field paths may be dotted and traverse arrays of subdocuments. A condition
//! on an array field matches if it matches the array or any element.

use lookup_core::{LookupError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Returns whether `document` satisfies `filter`.
pub fn matches(document: &Value, filter: &Value) -> Result<bool> {
    let clauses = filter
        .as_object()
        .ok_or_else(|| LookupError::ExecutionFailure("filter must be a document".to_string()))?;
    matches_clauses(document, clauses)
}

fn matches_clauses(document: &Value, clauses: &Map<String, Value>) -> Result<bool> {
    for (key, condition) in clauses {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in sub_filters(key, condition)? {
                    if !matches(document, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in sub_filters(key, condition)? {
                    if matches(document, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in sub_filters(key, condition)? {
                    if matches(document, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$text" => text_matches(document, condition)?,
            op if op.starts_with('$') => {
                return Err(LookupError::ExecutionFailure(format!(
                    "unsupported query operator '{}'",
                    op
                )))
            }
            path => field_matches(document, path, condition)?,
        };

        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(operator: &str, condition: &'a Value) -> Result<&'a Vec<Value>> {
    match condition.as_array() {
        Some(filters) if !filters.is_empty() => Ok(filters),
        _ => Err(LookupError::ExecutionFailure(format!(
            "{} must be a nonempty array",
            operator
        ))),
    }
}

/// Values at a dotted path, descending into arrays of subdocuments.
pub fn resolve_path<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();
    collect_path(document, &segments, &mut found);
    found
}

fn collect_path<'a>(value: &'a Value, segments: &[&str], found: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_path(child, rest, found);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect_path(child, rest, found);
                }
            } else {
                for item in items.iter().filter(|item| item.is_object()) {
                    collect_path(item, segments, found);
                }
            }
        }
        _ => {}
    }
}

/// Resolved values plus the elements of any resolved arrays.
fn candidates<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for value in resolve_path(document, path) {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn is_operator_document(condition: &Value) -> bool {
    match condition.as_object() {
        Some(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

fn field_matches(document: &Value, path: &str, condition: &Value) -> Result<bool> {
    if !is_operator_document(condition) {
        return Ok(equals_any(document, path, condition));
    }

    let operators = match condition.as_object() {
        Some(map) => map,
        None => return Ok(false),
    };

    for (operator, operand) in operators {
        let satisfied = match operator.as_str() {
            "$eq" => equals_any(document, path, operand),
            "$ne" => !equals_any(document, path, operand),
            "$in" => in_list(document, path, operator, operand)?,
            "$nin" => !in_list(document, path, operator, operand)?,
            "$all" => {
                let required = operand_list(operator, operand)?;
                let present = candidates(document, path);
                !required.is_empty()
                    && required
                        .iter()
                        .all(|wanted| present.iter().any(|v| values_equal(v, wanted)))
            }
            "$exists" => {
                let wanted = operand.as_bool().ok_or_else(|| {
                    LookupError::ExecutionFailure("$exists expects a boolean".to_string())
                })?;
                !resolve_path(document, path).is_empty() == wanted
            }
            "$gt" => compares(document, path, operand, |o| o == Ordering::Greater),
            "$gte" => compares(document, path, operand, |o| o != Ordering::Less),
            "$lt" => compares(document, path, operand, |o| o == Ordering::Less),
            "$lte" => compares(document, path, operand, |o| o != Ordering::Greater),
            other => {
                return Err(LookupError::ExecutionFailure(format!(
                    "unsupported query operator '{}'",
                    other
                )))
            }
        };

        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operand_list<'a>(operator: &str, operand: &'a Value) -> Result<&'a Vec<Value>> {
    operand
        .as_array()
        .ok_or_else(|| LookupError::ExecutionFailure(format!("{} needs an array", operator)))
}

fn equals_any(document: &Value, path: &str, target: &Value) -> bool {
    let present = candidates(document, path);
    if target.is_null() && present.is_empty() {
        return true;
    }
    present.iter().any(|value| values_equal(value, target))
}

fn in_list(document: &Value, path: &str, operator: &str, operand: &Value) -> Result<bool> {
    let options = operand_list(operator, operand)?;
    Ok(options
        .iter()
        .any(|option| equals_any(document, path, option)))
}

fn compares<F>(document: &Value, path: &str, operand: &Value, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    candidates(document, path)
        .into_iter()
        .filter_map(|value| comparable(value, operand))
        .any(accept)
}

/// Ordering between values of the same kind (numbers or strings).
fn comparable(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// JSON equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => left == right,
    }
}

fn text_matches(document: &Value, condition: &Value) -> Result<bool> {
    let search = condition
        .get("$search")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            LookupError::ExecutionFailure("$text requires a $search string".to_string())
        })?;

    let terms: Vec<String> = tokenize(search).collect();
    if terms.is_empty() {
        return Ok(false);
    }

    let mut strings = Vec::new();
    collect_strings(document, &mut strings);

    Ok(strings
        .into_iter()
        .flat_map(tokenize)
        .any(|token| terms.contains(&token)))
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}
