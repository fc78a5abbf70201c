//! Listener, lifecycle and stream configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A named listening address.
///
/// The name is the socket's identity across generations: a successor adopts
/// the inherited socket carrying the same name instead of binding again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    /// `host:port`; hostnames are resolved at bind time
    pub address: String,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Process lifecycle and upgrade timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long a draining generation waits for streams to finish
    pub drain_grace_secs: u64,
    /// Ceiling past the drain deadline after which the process is killed outright
    pub hard_exit_secs: u64,
    /// How long to wait for a successor to report ready
    pub readiness_timeout_secs: u64,
    pub pid_file: Option<PathBuf>,
    /// Unix socket accepting `upgrade`, `stop` and `status` commands
    pub control_socket: Option<PathBuf>,
    /// Program started as the successor; the running executable when unset
    pub successor_program: Option<PathBuf>,
    /// Arguments for the successor; the current arguments when unset
    pub successor_args: Option<Vec<String>>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_grace_secs: default_drain_grace(),
            hard_exit_secs: default_hard_exit(),
            readiness_timeout_secs: default_readiness_timeout(),
            pid_file: None,
            control_socket: None,
            successor_program: None,
            successor_args: None,
        }
    }
}

impl LifecycleConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn hard_exit(&self) -> Duration {
        Duration::from_secs(self.hard_exit_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

/// Event stream and page settings of the HTTP harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Time between two events on `/ping`
    pub interval_ms: u64,
    /// HTML served at `/`; an embedded page is used when unset
    pub index_file: Option<PathBuf>,
    /// Appended to every event's data, e.g. `v2`
    pub release_tag: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stream_interval_ms(),
            index_file: None,
            release_tag: None,
        }
    }
}

impl StreamConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

pub fn default_listener() -> ListenerConfig {
    ListenerConfig::new("http", "127.0.0.1:8080")
}

pub fn default_drain_grace() -> u64 {
    30
}

pub fn default_hard_exit() -> u64 {
    10
}

pub fn default_readiness_timeout() -> u64 {
    60
}

pub fn default_stream_interval_ms() -> u64 {
    1000
}
