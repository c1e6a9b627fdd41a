//! Accessibility tree compression.
//!
//! Takes the raw node list from `Accessibility.getFullAXTree` and produces
//! either a filtered node array (interesting nodes only, still a connected
//! tree) or a compact line-oriented text rendering in which every line is
//! addressable by `uid=<depth>_<backendDOMNodeId>`.

mod props;
mod render;
mod roles;

pub use props::{node_name, node_property, node_role, property_is_true, property_string};
pub use render::render_text;
pub use roles::{is_control_role, is_landmark_role, is_leaf_role};

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use props::{node_description, node_id};

/// True when the node carries the `ignored` flag or the `Ignored` role.
pub fn is_ignored(node: &Value) -> bool {
    if node
        .get("ignored")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return true;
    }
    node_role(node).as_deref() == Some("Ignored")
}

fn is_text_role(role: Option<&str>) -> bool {
    matches!(role, Some("StaticText") | Some("text"))
}

/// A node is a leaf when its role says so, it has no children, or every
/// child is ignored or pure text.
fn is_leaf<'a>(node: &Value, by_id: &HashMap<&'a str, &'a Value>) -> bool {
    let role = node_role(node);
    if role.as_deref().map(is_leaf_role).unwrap_or(false) {
        return true;
    }

    let Some(children) = node.get("childIds").and_then(Value::as_array) else {
        return true;
    };
    if children.is_empty() {
        return true;
    }

    children.iter().all(|id| {
        let Some(child) = id.as_str().and_then(|id| by_id.get(id)) else {
            return true;
        };
        if is_ignored(child) {
            return true;
        }
        let child_role = node_role(child);
        is_text_role(child_role.as_deref()) || child_role.as_deref() == Some("none")
    })
}

/// The "interesting" predicate: is this node worth surfacing to an agent?
///
/// `inside_control` is true when any ancestor's role is a control role;
/// non-focusable descendants of controls are suppressed unless they are
/// themselves controls or landmarks.
pub fn is_interesting<'a>(
    node: &Value,
    by_id: &HashMap<&'a str, &'a Value>,
    inside_control: bool,
) -> bool {
    if is_ignored(node) {
        return false;
    }

    let role = node_role(node);
    let role = role.as_deref().unwrap_or("");
    let name = node_name(node).filter(|n| !n.is_empty());

    let structurally_interesting = is_landmark_role(role) || is_control_role(role);
    if structurally_interesting {
        return true;
    }

    let focusable = property_is_true(node, "focusable");
    if inside_control && !focusable {
        return false;
    }

    if focusable
        || property_is_true(node, "editable")
        || property_is_true(node, "modal")
        || property_string(node, "live")
            .map(|live| live != "off")
            .unwrap_or(false)
    {
        return true;
    }

    if role == "heading" && name.is_some() {
        return true;
    }

    if is_leaf(node, by_id)
        && (name.is_some() || node_description(node).filter(|d| !d.is_empty()).is_some())
    {
        return true;
    }

    if role == "image" && name.is_some() {
        return true;
    }

    is_text_role(Some(role)) && name.is_some()
}

/// Filter the raw node list down to interesting nodes plus the ancestors
/// needed to keep the tree connected. Node order is preserved; `childIds`
/// are pruned to surviving children and dropped entirely when empty.
pub fn filter_interesting(nodes: &[Value]) -> Vec<Value> {
    let Some(root) = nodes.first() else {
        return Vec::new();
    };

    let by_id: HashMap<&str, &Value> = nodes
        .iter()
        .filter_map(|node| node_id(node).map(|id| (id, node)))
        .collect();

    let mut parents: HashMap<&str, &str> = HashMap::new();
    for node in nodes {
        let Some(id) = node_id(node) else { continue };
        if let Some(children) = node.get("childIds").and_then(Value::as_array) {
            for child in children.iter().filter_map(Value::as_str) {
                parents.insert(child, id);
            }
        }
    }

    let mut keep: HashSet<&str> = HashSet::new();
    let Some(root_id) = node_id(root) else {
        return Vec::new();
    };

    // DFS carrying the inside-control flag down each branch.
    let mut stack: Vec<(&str, bool)> = vec![(root_id, false)];
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some((id, inside_control)) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = by_id.get(id) else { continue };

        if is_interesting(node, &by_id, inside_control) {
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                if !keep.insert(current) {
                    break;
                }
                cursor = parents.get(current).copied();
            }
        }

        let child_inside = inside_control
            || node_role(node)
                .as_deref()
                .map(is_control_role)
                .unwrap_or(false);
        if let Some(children) = node.get("childIds").and_then(Value::as_array) {
            for child in children.iter().filter_map(Value::as_str) {
                stack.push((child, child_inside));
            }
        }
    }

    nodes
        .iter()
        .filter(|node| node_id(node).map(|id| keep.contains(id)).unwrap_or(false))
        .map(|node| {
            let mut out = node.clone();
            if let Some(obj) = out.as_object_mut() {
                let pruned: Vec<Value> = obj
                    .get("childIds")
                    .and_then(Value::as_array)
                    .map(|children| {
                        children
                            .iter()
                            .filter(|id| {
                                id.as_str().map(|id| keep.contains(id)).unwrap_or(false)
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if pruned.is_empty() {
                    obj.remove("childIds");
                } else {
                    obj.insert("childIds".into(), Value::Array(pruned));
                }
            }
            out
        })
        .collect()
}
