//! # Validation Module
//!
//! Checks applied to a payload before it is allowed into the sync queue.
//!
//! ## Rules by Operation Kind
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  kind     │ payload shape        │ id required                          │
//! │  ─────────┼──────────────────────┼────────────────────────────────────  │
//! │  insert   │ JSON object          │ no (server or client may assign)     │
//! │  update   │ JSON object          │ yes                                  │
//! │  delete   │ object or bare id    │ yes                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A payload that fails here never reaches the queue, so a replay can
//! always find the row it targets.

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::OperationKind;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates an entity id.
///
/// ## Example
/// ```rust
/// use tether_core::validation::validate_id;
///
/// assert!(validate_id("c1").is_ok());
/// assert!(validate_id("   ").is_err());
/// ```
pub fn validate_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    Ok(())
}

/// Validates a payload for the given operation kind.
pub fn validate_payload(kind: OperationKind, payload: &Value) -> ValidationResult<()> {
    match kind {
        OperationKind::Insert => {
            if !payload.is_object() {
                return Err(ValidationError::NotAnObject { kind });
            }
        }
        OperationKind::Update => {
            if !payload.is_object() {
                return Err(ValidationError::NotAnObject { kind });
            }
            if resource_id_of(payload).is_none() {
                return Err(ValidationError::MissingId { kind });
            }
        }
        OperationKind::Delete => {
            if resource_id_of(payload).is_none() {
                return Err(ValidationError::MissingId { kind });
            }
        }
    }
    Ok(())
}

/// Extracts the row id from a payload.
///
/// Accepts `{"id": "..."}`, `{"id": 42}`, or a bare string id.
pub fn resource_id_of(payload: &Value) -> Option<String> {
    let id = match payload {
        Value::Object(map) => map.get("id")?,
        other => other,
    };
    match id {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
