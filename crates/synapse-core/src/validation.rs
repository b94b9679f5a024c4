//! # Validation Module
//!
//! Typed value checks applied before a value reaches an entity record.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Façade setters (typed Rust signatures)                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE - per-key kind checks on serde_json::Value       │
//! │           (dates, timestamps, booleans, numbers, option lists)         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Row store (NOT NULL / UNIQUE constraints)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `null` passes every kind: it clears the key.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::KeyKind;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted explicit unique id.
pub const MAX_UNIQUE_ID_LEN: usize = 255;

// =============================================================================
// Value Validators
// =============================================================================

/// Validates `value` against the kind declared for `key`.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use synapse_core::validation::validate_value;
/// use synapse_core::KeyKind;
///
/// assert!(validate_value("last_reset", KeyKind::Timestamp, &json!("2024-01-01T00:00:00Z")).is_ok());
/// assert!(validate_value("last_reset", KeyKind::Timestamp, &json!("yesterday")).is_err());
/// ```
pub fn validate_value(key: &str, kind: KeyKind, value: &Value) -> ValidationResult<()> {
    if value.is_null() {
        return Ok(());
    }

    match kind {
        KeyKind::Any => Ok(()),
        KeyKind::Bool => expect(key, value.is_boolean(), "a boolean"),
        KeyKind::Number => expect(key, value.is_number(), "a number"),
        KeyKind::String => expect(key, value.is_string(), "a string"),
        KeyKind::Object => expect(key, value.is_object(), "an object"),
        KeyKind::StringList => {
            let is_list = value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            expect(key, is_list, "a list of strings")
        }
        KeyKind::Date => {
            let text = value.as_str().ok_or_else(|| wrong_type(key, "a date string"))?;
            validate_date(key, text)
        }
        KeyKind::Timestamp => {
            let text = value
                .as_str()
                .ok_or_else(|| wrong_type(key, "a timestamp string"))?;
            validate_timestamp(key, text)
        }
    }
}

/// Validates that `value` is one of `options`.
///
/// `null` and an empty option list accept anything.
pub fn validate_option(field: &str, value: &Value, options: &[Value]) -> ValidationResult<()> {
    if value.is_null() || options.is_empty() || options.contains(value) {
        return Ok(());
    }

    Err(ValidationError::NotAllowed {
        field: field.to_string(),
        allowed: options
            .iter()
            .map(|option| match option.as_str() {
                Some(text) => text.to_string(),
                None => option.to_string(),
            })
            .collect(),
    })
}

/// Validates a calendar date in `YYYY-MM-DD` form.
pub fn validate_date(field: &str, text: &str) -> ValidationResult<()> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("'{}' is not a YYYY-MM-DD date ({})", text, e),
        })
}

/// Validates an RFC 3339 timestamp.
pub fn validate_timestamp(field: &str, text: &str) -> ValidationResult<()> {
    DateTime::parse_from_rfc3339(text)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("'{}' is not an RFC 3339 timestamp ({})", text, e),
        })
}

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates an explicitly supplied unique id.
///
/// ## Rules
/// - Must not be empty (after trimming)
/// - At most 255 characters
pub fn validate_unique_id(unique_id: &str) -> ValidationResult<()> {
    let trimmed = unique_id.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::Required {
            field: "unique_id".to_string(),
        });
    }

    if trimmed.len() > MAX_UNIQUE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "unique_id".to_string(),
            max: MAX_UNIQUE_ID_LEN,
        });
    }

    Ok(())
}

fn expect(key: &str, ok: bool, expected: &str) -> ValidationResult<()> {
    if ok {
        Ok(())
    } else {
        Err(wrong_type(key, expected))
    }
}

fn wrong_type(key: &str, expected: &str) -> ValidationError {
    ValidationError::WrongType {
        field: key.to_string(),
        expected: expected.to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_passes_every_kind() {
        for kind in [KeyKind::Bool, KeyKind::Date, KeyKind::Timestamp, KeyKind::StringList] {
            assert!(validate_value("k", kind, &Value::Null).is_ok());
        }
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let err = validate_value("native_value", KeyKind::Date, &json!("2024-02-30")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFormat { .. }));
        assert!(validate_value("native_value", KeyKind::Date, &json!("2024-02-29")).is_ok());
    }

    #[test]
    fn test_timestamp_requires_string() {
        let err = validate_value("last_reset", KeyKind::Timestamp, &json!(12)).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { .. }));
    }

    #[test]
    fn test_string_list() {
        assert!(validate_value("options", KeyKind::StringList, &json!(["a", "b"])).is_ok());
        assert!(validate_value("options", KeyKind::StringList, &json!(["a", 1])).is_err());
        assert!(validate_value("options", KeyKind::StringList, &json!("a")).is_err());
    }

    #[test]
    fn test_bool_kind() {
        assert!(validate_value("is_on", KeyKind::Bool, &json!(true)).is_ok());
        assert!(validate_value("is_on", KeyKind::Bool, &json!("on")).is_err());
    }

    #[test]
    fn test_validate_unique_id() {
        assert!(validate_unique_id("sw1").is_ok());
        assert!(validate_unique_id("   ").is_err());
        assert!(validate_unique_id(&"x".repeat(300)).is_err());
    }
}
