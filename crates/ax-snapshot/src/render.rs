//! Compact text rendering of a (filtered) AX node list.

use std::collections::HashMap;

use serde_json::Value;

use crate::props::{node_id, node_name, node_property, node_role, property_is_true, property_string};
use crate::is_ignored;

/// Render the tree rooted at the first node, one line per node, indented
/// two spaces per depth level. Lines are keyed `uid=<depth>_<backendDOMNodeId>`
/// so later element-targeted actions can resolve them without selectors.
pub fn render_text(nodes: &[Value]) -> String {
    let Some(root) = nodes.first() else {
        return String::new();
    };

    let by_id: HashMap<&str, &Value> = nodes
        .iter()
        .filter_map(|node| node_id(node).map(|id| (id, node)))
        .collect();

    let mut lines: Vec<String> = Vec::new();
    let Some(root_id) = node_id(root) else {
        return String::new();
    };

    let mut stack: Vec<(&str, usize)> = vec![(root_id, 0)];
    while let Some((id, depth)) = stack.pop() {
        let Some(node) = by_id.get(id) else { continue };

        let child_depth = if let Some(line) = format_line(node, depth) {
            lines.push(line);
            depth + 1
        } else {
            depth
        };

        if let Some(children) = node.get("childIds").and_then(Value::as_array) {
            // Push in reverse so children render in document order.
            for child in children.iter().filter_map(Value::as_str).rev() {
                stack.push((child, child_depth));
            }
        }
    }

    lines.join("\n")
}

fn format_line(node: &Value, depth: usize) -> Option<String> {
    if is_ignored(node) {
        return None;
    }

    let role = node_role(node).unwrap_or_default();
    let uid = match node.get("backendDOMNodeId").and_then(Value::as_i64) {
        Some(backend_id) => format!("{depth}_{backend_id}"),
        None => node_id(node).unwrap_or_default().to_string(),
    };

    let mut line = format!("{}uid={} {}", "  ".repeat(depth), uid, role);

    let name = node_name(node).unwrap_or_default();
    if !name.is_empty() {
        line.push_str(&format!(" \"{name}\""));
    }

    if let Some(url) = property_string(node, "url").filter(|u| !u.is_empty()) {
        line.push_str(&format!(" url=\"{url}\""));
    }
    for flag in ["focusable", "focused", "multiline"] {
        if property_is_true(node, flag) {
            line.push_str(&format!(" {flag}"));
        }
    }
    match property_string(node, "checked").as_deref() {
        Some("true") => line.push_str(" checked"),
        Some("mixed") => line.push_str(" checked=mixed"),
        _ => {}
    }
    if let Some(expanded) = node_property(node, "expanded") {
        if expanded == Value::Bool(true) || expanded == Value::String("true".into()) {
            line.push_str(" expanded");
        } else {
            line.push_str(" collapsed");
        }
    }
    for flag in ["selected", "disabled", "required"] {
        if property_is_true(node, flag) {
            line.push_str(&format!(" {flag}"));
        }
    }
    if let Some(level) = property_string(node, "level") {
        line.push_str(&format!(" level={level}"));
    }
    if let Some(value) = property_string(node, "value").filter(|v| !v.is_empty() && *v != name) {
        line.push_str(&format!(" value=\"{value}\""));
    }

    Some(line)
}
