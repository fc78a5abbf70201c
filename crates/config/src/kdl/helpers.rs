//! Small accessors over KDL nodes.
//!
//! Values are read from child nodes with a single positional argument,
//! e.g. `drain-grace-secs 30` inside a `lifecycle { ... }` block.

use kdl::{KdlNode, KdlValue};

fn first_value<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.children()?
        .get(name)?
        .entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// First positional argument of `node` itself, e.g. `listener "http"`
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .and_then(|entry| entry.value().as_string())
        .map(str::to_string)
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    first_value(node, name)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// Every positional string argument, e.g. `successor-args "-c" "/etc/baton.kdl"`
pub fn get_string_list(node: &KdlNode, name: &str) -> Option<Vec<String>> {
    let child = node.children()?.get(name)?;
    Some(
        child
            .entries()
            .iter()
            .filter(|entry| entry.name().is_none())
            .filter_map(|entry| entry.value().as_string())
            .map(str::to_string)
            .collect(),
    )
}

pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    first_value(node, name).and_then(|v| v.as_integer())
}

/// Like [`get_int_entry`] but rejects negative numbers
pub fn get_u64_entry(node: &KdlNode, name: &str) -> anyhow::Result<Option<u64>> {
    match get_int_entry(node, name) {
        None => Ok(None),
        Some(v) => u64::try_from(v).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "'{}' in '{}' must be a non-negative integer, got {}",
                name,
                node.name().value(),
                v
            )
        }),
    }
}
