//! KDL configuration format.
//!
//! ```kdl
//! listeners {
//!     listener "http" {
//!         address "127.0.0.1:8080"
//!     }
//! }
//! lifecycle {
//!     drain-grace-secs 30
//!     hard-exit-secs 10
//!     readiness-timeout-secs 60
//!     pid-file "/run/baton.pid"
//!     control-socket "/run/baton.sock"
//! }
//! stream {
//!     interval-ms 1000
//!     release-tag "v2"
//! }
//! ```

mod helpers;
mod server;

use anyhow::Result;
use tracing::{debug, warn};

use crate::Config;

pub use server::{parse_lifecycle_config, parse_listeners, parse_stream_config};

/// Build a [`Config`] from KDL source text
pub fn parse_document(source: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| anyhow::anyhow!("Invalid KDL: {}", e))?;

    let mut config = Config::default();
    let mut saw_listeners = false;

    for node in doc.nodes() {
        match node.name().value() {
            "listeners" => {
                // Explicit listener blocks replace the default listener
                if !saw_listeners {
                    config.listeners.clear();
                    saw_listeners = true;
                }
                config.listeners.extend(parse_listeners(node)?);
            }
            "lifecycle" => config.lifecycle = parse_lifecycle_config(node)?,
            "stream" => config.stream = parse_stream_config(node)?,
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    debug!(
        listeners = config.listeners.len(),
        "Parsed KDL configuration"
    );

    Ok(config)
}
