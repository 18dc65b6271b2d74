//! JSON merge patch (RFC 7396): apply a patch, and compute the minimal
//! patch that turns one document into another.

use serde::Serialize;
use serde_json::{Map, Value};

/// Apply `patch` to `target` in place. `null` deletes a key, objects merge
/// recursively, every other value (arrays included) replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Minimal merge patch from `old` to `new`. Returns an empty object when
/// the documents are equal.
pub fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value @ Value::Object(_)) if new_value.is_object() => {
                        patch.insert(key.clone(), diff(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Patch body `{"<field>": <diff>}` for a sub-document, or `None` when
/// nothing changed.
pub fn field_patch<T: Serialize>(
    field: &str,
    old: &T,
    new: &T,
) -> Result<Option<Value>, serde_json::Error> {
    let delta = diff(&serde_json::to_value(old)?, &serde_json::to_value(new)?);
    if delta.as_object().is_some_and(Map::is_empty) {
        return Ok(None);
    }
    let mut body = Map::new();
    body.insert(field.to_string(), delta);
    Ok(Some(Value::Object(body)))
}
