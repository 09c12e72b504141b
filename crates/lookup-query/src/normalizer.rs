//! Request normalization against the query key allow-list.

use lookup_core::{LookupError, QueryKey, QueryKeyPolicy, QuerySpec, Result, AGGREGATION_KEY};
use serde_json::Value;
use std::sync::Arc;

/// Turns raw client requests into a [`QuerySpec`].
///
/// Rejections happen before anything else is consulted, so an invalid request
/// never reaches the permission or document store.
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    policy: Arc<QueryKeyPolicy>,
}

impl QueryNormalizer {
    pub fn new(policy: Arc<QueryKeyPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QueryKeyPolicy {
        &self.policy
    }

    /// Validate and normalize one request.
    ///
    /// Keys are checked in sorted order, so the first reported error does not
    /// depend on the client's key order.
    pub fn normalize(&self, request: &Value) -> Result<QuerySpec> {
        let fields = request
            .as_object()
            .ok_or_else(|| LookupError::InvalidQuery("request must be a JSON object".to_string()))?;

        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort();

        let mut spec = QuerySpec::default();
        for name in keys {
            let value = &fields[name.as_str()];

            if name == AGGREGATION_KEY {
                spec.aggregation = Some(self.aggregation(value)?);
                continue;
            }

            let key = match name.parse::<QueryKey>() {
                Ok(key) if self.policy.is_allowed(key) => key,
                _ => {
                    return Err(LookupError::InvalidQuery(format!(
                        "query key '{}' is not allowed",
                        name
                    )))
                }
            };

            match key {
                QueryKey::Query => {
                    let fragment = value.as_object().ok_or_else(|| {
                        LookupError::InvalidQuery("'query' must be a JSON object".to_string())
                    })?;
                    spec.query = Some(fragment.clone());
                }
                QueryKey::FreeText => {
                    spec.free_text = Some(scalar(key, value)?);
                }
                _ => {
                    let values = if self.policy.is_list_typed(key) {
                        string_list(key, value)?
                    } else {
                        vec![scalar(key, value)?]
                    };
                    spec.set_list(key, values);
                }
            }
        }

        Ok(spec)
    }

    fn aggregation(&self, value: &Value) -> Result<Vec<Value>> {
        if !self.policy.allows_direct_aggregation() {
            return Err(LookupError::InvalidQuery(format!(
                "query key '{}' is not allowed: direct aggregation is disabled",
                AGGREGATION_KEY
            )));
        }

        let stages = value.as_array().ok_or_else(|| {
            LookupError::InvalidQuery(format!("'{}' must be a list of stages", AGGREGATION_KEY))
        })?;
        if let Some(position) = stages.iter().position(|stage| !stage.is_object()) {
            return Err(LookupError::InvalidQuery(format!(
                "aggregation stage {} is not a JSON object",
                position
            )));
        }
        Ok(stages.clone())
    }
}

fn scalar(key: QueryKey, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) => Err(LookupError::InvalidQuery(format!(
            "'{}' does not accept a list",
            key
        ))),
        _ => Err(LookupError::InvalidQuery(format!(
            "'{}' must be a string",
            key
        ))),
    }
}

fn string_list(key: QueryKey, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    LookupError::InvalidQuery(format!("'{}' must only contain strings", key))
                })
            })
            .collect(),
        _ => Err(LookupError::InvalidQuery(format!(
            "'{}' must be a string or a list of strings",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> QueryNormalizer {
        QueryNormalizer::new(Arc::new(QueryKeyPolicy::default()))
    }

    fn normalizer_with(allowed: &[&str], list_keys: &[&str], aggregation: bool) -> QueryNormalizer {
        let policy = QueryKeyPolicy::new(allowed, list_keys, aggregation).unwrap();
        QueryNormalizer::new(Arc::new(policy))
    }

    #[test]
    fn test_scalar_wrapped_for_list_typed_key() {
        let scalar = normalizer().normalize(&json!({"tags": "alpha"})).unwrap();
        let list = normalizer().normalize(&json!({"tags": ["alpha"]})).unwrap();

        assert_eq!(scalar.tags, Some(vec!["alpha".to_string()]));
        assert_eq!(scalar, list);
    }

    #[test]
    fn test_unknown_key_named_in_error() {
        let n = normalizer_with(&["free_text", "tags"], &["tags"], false);
        let err = n
            .normalize(&json!({"free_text": "foo", "evil_key": "x"}))
            .unwrap_err();

        assert!(matches!(err, LookupError::InvalidQuery(_)));
        assert!(err.to_string().contains("evil_key"));
    }

    #[test]
    fn test_known_key_outside_allow_list_rejected() {
        let n = normalizer_with(&["free_text", "tags"], &["tags"], false);
        let err = n.normalize(&json!({"uuids": "u-1"})).unwrap_err();
        assert!(err.to_string().contains("uuids"));
    }

    #[test]
    fn test_non_list_key_requires_scalar() {
        let spec = normalizer().normalize(&json!({"uuids": "u-1"})).unwrap();
        assert_eq!(spec.uuids, Some(vec!["u-1".to_string()]));

        let err = normalizer()
            .normalize(&json!({"uuids": ["u-1", "u-2"]}))
            .unwrap_err();
        assert!(matches!(err, LookupError::InvalidQuery(_)));

        let err = normalizer()
            .normalize(&json!({"free_text": ["a"]}))
            .unwrap_err();
        assert!(err.to_string().contains("free_text"));
    }

    #[test]
    fn test_non_string_values_rejected() {
        assert!(normalizer().normalize(&json!({"tags": 3})).is_err());
        assert!(normalizer().normalize(&json!({"tags": ["a", 3]})).is_err());
        assert!(normalizer().normalize(&json!({"free_text": null})).is_err());
    }

    #[test]
    fn test_non_object_request_rejected() {
        let err = normalizer().normalize(&json!(["tags"])).unwrap_err();
        assert!(matches!(err, LookupError::InvalidQuery(_)));
    }

    #[test]
    fn test_raw_query_requires_allow_list_entry() {
        let err = normalizer()
            .normalize(&json!({"query": {"name": "x"}}))
            .unwrap_err();
        assert!(err.to_string().contains("query"));

        let n = normalizer_with(&["free_text", "query"], &[], false);
        let spec = n.normalize(&json!({"query": {"name": "x"}})).unwrap();
        assert_eq!(spec.query.unwrap()["name"], "x");

        let err = n.normalize(&json!({"query": "name = x"})).unwrap_err();
        assert!(matches!(err, LookupError::InvalidQuery(_)));
    }

    #[test]
    fn test_aggregation_requires_flag() {
        let request = json!({"aggregation": [{"$count": "n"}]});

        let err = normalizer().normalize(&request).unwrap_err();
        assert!(err.to_string().contains("aggregation"));

        let n = normalizer_with(&["free_text"], &[], true);
        let spec = n.normalize(&request).unwrap();
        assert_eq!(spec.aggregation, Some(vec![json!({"$count": "n"})]));

        let err = n
            .normalize(&json!({"aggregation": [{"$count": "n"}, "oops"]}))
            .unwrap_err();
        assert!(err.to_string().contains("stage 1"));
    }

    #[test]
    fn test_first_error_is_deterministic() {
        let n = normalizer_with(&["free_text", "tags"], &["tags"], false);
        let err = n
            .normalize(&json!({"zzz": 1, "aaa": 2, "tags": "x"}))
            .unwrap_err();
        assert!(err.to_string().contains("'aaa'"));
    }

    #[test]
    fn test_empty_request_is_empty_spec() {
        let spec = normalizer().normalize(&json!({})).unwrap();
        assert_eq!(spec, QuerySpec::default());
    }
}
