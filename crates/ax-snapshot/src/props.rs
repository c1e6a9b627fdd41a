//! Tolerant accessors over raw AX nodes.
//!
//! CDP delivers node fields in two shapes depending on domain version:
//! a typed wrapper (`{"type": "...", "value": ...}`) or the raw value.
//! Named properties additionally live in the node's `properties` array.

use serde_json::Value;

fn unwrap_ax_value(value: &Value) -> &Value {
    match value {
        Value::Object(obj) => obj.get("value").unwrap_or(value),
        _ => value,
    }
}

pub(crate) fn node_id(node: &Value) -> Option<&str> {
    node.get("nodeId").and_then(Value::as_str)
}

pub fn node_role(node: &Value) -> Option<String> {
    node.get("role")
        .map(unwrap_ax_value)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

pub fn node_name(node: &Value) -> Option<String> {
    node.get("name")
        .map(unwrap_ax_value)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

pub(crate) fn node_description(node: &Value) -> Option<String> {
    node.get("description")
        .map(unwrap_ax_value)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Look a property up by name: top-level field first, then the
/// `properties` array.
pub fn node_property(node: &Value, name: &str) -> Option<Value> {
    if let Some(field) = node.get(name) {
        return Some(unwrap_ax_value(field).clone());
    }

    let properties = node.get("properties")?.as_array()?;
    properties.iter().find_map(|entry| {
        let entry_name = entry.get("name").map(unwrap_ax_value)?.as_str()?;
        if entry_name == name {
            entry.get("value").map(|v| unwrap_ax_value(v).clone())
        } else {
            None
        }
    })
}

/// Truthiness for boolean-ish AX properties (`true` or `"true"`).
pub fn property_is_true(node: &Value, name: &str) -> bool {
    match node_property(node, name) {
        Some(Value::Bool(flag)) => flag,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

/// String rendering of a property value; booleans and numbers are
/// stringified the way the wire formats them.
pub fn property_string(node: &Value, name: &str) -> Option<String> {
    match node_property(node, name)? {
        Value::String(s) => Some(s),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
