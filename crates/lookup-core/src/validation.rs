//! Input validation for identities, base URIs and dataset records
//!
//! Provides validation functions to prevent:
//! - Oversized or empty identifiers reaching the permission store
//! - Base URIs with whitespace or control characters
//! - Registration of dataset records missing their identifying fields

use crate::{LookupError, Result};
use serde_json::Value;

/// Maximum length for usernames
pub const MAX_USERNAME_LEN: usize = 64;

/// Minimum length for base URIs
///
/// Amazon S3 bucket names are 3-63 characters, Azure storage account
/// names 3-24.
pub const MIN_BASE_URI_LEN: usize = 3;

/// Maximum length for base URIs
pub const MAX_BASE_URI_LEN: usize = 255;

/// Validate a username
///
/// Requirements:
/// - Not empty
/// - <= 64 characters
/// - No whitespace or control characters
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(LookupError::ValidationError(
            "Username cannot be empty".to_string(),
        ));
    }

    let length = username.chars().count();
    if length > MAX_USERNAME_LEN {
        return Err(LookupError::ValidationError(format!(
            "Username too long: {} > {} characters",
            length,
            MAX_USERNAME_LEN
        )));
    }

    if username
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(LookupError::ValidationError(
            "Username cannot contain whitespace or control characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a base URI
///
/// Requirements:
/// - 3-255 characters
/// - No whitespace or control characters
pub fn validate_base_uri(base_uri: &str) -> Result<()> {
    // Counted in characters, matching SQLite's length()
    let length = base_uri.chars().count();
    if length < MIN_BASE_URI_LEN {
        return Err(LookupError::ValidationError(format!(
            "Base URI too short: {} < {} characters",
            length,
            MIN_BASE_URI_LEN
        )));
    }

    if length > MAX_BASE_URI_LEN {
        return Err(LookupError::ValidationError(format!(
            "Base URI too long: {} > {} characters",
            length,
            MAX_BASE_URI_LEN
        )));
    }

    if base_uri
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(LookupError::ValidationError(
            "Base URI cannot contain whitespace or control characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate the minimum dataset record accepted for registration
///
/// Requirements:
/// - JSON object
/// - `uuid` is a valid UUID string
/// - `type` is `"dataset"`
/// - `uri` is a non-empty string
pub fn validate_dataset_info(info: &Value) -> Result<()> {
    let obj = info.as_object().ok_or_else(|| {
        LookupError::ValidationError("Dataset info must be a JSON object".to_string())
    })?;

    let uuid = obj
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| LookupError::ValidationError("Dataset info missing 'uuid'".to_string()))?;
    uuid::Uuid::parse_str(uuid).map_err(|e| {
        LookupError::ValidationError(format!("Dataset uuid '{}' is invalid: {}", uuid, e))
    })?;

    match obj.get("type").and_then(Value::as_str) {
        Some("dataset") => {}
        Some(other) => {
            return Err(LookupError::ValidationError(format!(
                "Dataset info has type '{}', expected 'dataset'",
                other
            )))
        }
        None => {
            return Err(LookupError::ValidationError(
                "Dataset info missing 'type'".to_string(),
            ))
        }
    }

    match obj.get("uri").and_then(Value::as_str) {
        Some(uri) if !uri.is_empty() => Ok(()),
        _ => Err(LookupError::ValidationError(
            "Dataset info missing 'uri'".to_string(),
        )),
    }
}
