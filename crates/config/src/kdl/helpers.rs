//! Small accessors over KDL nodes.
//!
//! Scalar settings are written as child nodes with one argument
//! (`email "ops@example.com"`); lists as child nodes with several
//! arguments (`dns-names "a.example.com" "b.example.com"`).

use std::time::Duration;

use anyhow::Result;
use kdl::{KdlNode, KdlValue};

use crate::duration::parse_duration;

/// Positional (unnamed) arguments of a node
fn arguments(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    arguments(node)
        .next()
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// Named property on the node itself (`issuer "x" kind="ClusterIssuer"`)
pub fn get_property_string(node: &KdlNode, key: &str) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .and_then(|e| e.value().as_string())
        .map(str::to_string)
}

/// Child node by name
pub fn get_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_child(node, name).and_then(get_first_arg_string)
}

pub fn get_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    get_child(node, name)
        .map(|child| {
            arguments(child)
                .filter_map(|v| v.as_string())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    get_child(node, name)
        .and_then(|child| arguments(child).next())
        .and_then(|v| v.as_integer())
}

/// Duration setting; accepts a string (`"90d"`) or an integer (seconds)
pub fn get_duration_entry(node: &KdlNode, name: &str) -> Result<Option<Duration>> {
    let Some(value) = get_child(node, name).and_then(|child| arguments(child).next()) else {
        return Ok(None);
    };

    if let Some(secs) = value.as_integer() {
        let secs = u64::try_from(secs)
            .map_err(|_| anyhow::anyhow!("'{}' must not be negative, got {}", name, secs))?;
        return Ok(Some(Duration::from_secs(secs)));
    }

    let text = value
        .as_string()
        .ok_or_else(|| anyhow::anyhow!("'{}' must be a duration such as \"90d\"", name))?;
    let duration = parse_duration(text).map_err(|e| anyhow::anyhow!("'{}': {}", name, e))?;
    Ok(Some(duration))
}
