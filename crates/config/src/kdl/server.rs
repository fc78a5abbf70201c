//! Listener, lifecycle and stream KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::server::*;

use super::helpers::{get_first_arg_string, get_string_entry, get_string_list, get_u64_entry};

/// Parse lifecycle configuration block
pub fn parse_lifecycle_config(node: &kdl::KdlNode) -> Result<LifecycleConfig> {
    trace!("Parsing lifecycle configuration block");

    let config = LifecycleConfig {
        drain_grace_secs: get_u64_entry(node, "drain-grace-secs")?
            .unwrap_or_else(default_drain_grace),
        hard_exit_secs: get_u64_entry(node, "hard-exit-secs")?.unwrap_or_else(default_hard_exit),
        readiness_timeout_secs: get_u64_entry(node, "readiness-timeout-secs")?
            .unwrap_or_else(default_readiness_timeout),
        pid_file: get_string_entry(node, "pid-file").map(PathBuf::from),
        control_socket: get_string_entry(node, "control-socket").map(PathBuf::from),
        successor_program: get_string_entry(node, "successor-program").map(PathBuf::from),
        successor_args: get_string_list(node, "successor-args"),
    };

    trace!(
        drain_grace_secs = config.drain_grace_secs,
        hard_exit_secs = config.hard_exit_secs,
        readiness_timeout_secs = config.readiness_timeout_secs,
        "Parsed lifecycle configuration"
    );

    Ok(config)
}

/// Parse stream configuration block
pub fn parse_stream_config(node: &kdl::KdlNode) -> Result<StreamConfig> {
    trace!("Parsing stream configuration block");

    Ok(StreamConfig {
        interval_ms: get_u64_entry(node, "interval-ms")?
            .unwrap_or_else(default_stream_interval_ms),
        index_file: get_string_entry(node, "index-file").map(PathBuf::from),
        release_tag: get_string_entry(node, "release-tag"),
    })
}

/// Parse listeners configuration block
pub fn parse_listeners(node: &kdl::KdlNode) -> Result<Vec<ListenerConfig>> {
    trace!("Parsing listeners configuration block");
    let mut listeners = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "listener" {
                continue;
            }

            let name = get_first_arg_string(child).ok_or_else(|| {
                anyhow::anyhow!(
                    "Listener requires a name argument, e.g., listener \"http\" {{ ... }}"
                )
            })?;

            let address = get_string_entry(child, "address").ok_or_else(|| {
                anyhow::anyhow!(
                    "Listener '{}' requires an 'address' field, e.g., address \"127.0.0.1:8080\"",
                    name
                )
            })?;

            trace!(listener = %name, address = %address, "Parsed listener");
            listeners.push(ListenerConfig { name, address });
        }
    }

    trace!(listener_count = listeners.len(), "Finished parsing listeners");
    Ok(listeners)
}
