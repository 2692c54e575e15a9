//! Shallow JSON merge used for optimistic updates.

use serde_json::Value;

/// Overlays the top-level fields of `patch` on `base`.
///
/// Nested objects are replaced, not merged. A missing or non-object base
/// yields the patch itself; a non-object patch replaces the base.
pub fn merge_shallow(base: Option<&Value>, patch: &Value) -> Value {
    match (base, patch) {
        (Some(Value::Object(base)), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
