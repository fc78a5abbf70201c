//! Handoff error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use baton_common::GenerationState;

/// Errors raised while binding, spawning or handing over a generation.
///
/// Startup errors (`Bind`, `Adopt`, `InvalidInheritance`) are fatal to the
/// generation that hits them. Upgrade errors (`Spawn`, `ReadinessTimeout`,
/// `SuccessorExited`, `Handshake`) abort the upgrade and leave the running
/// generation active.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("failed to bind listener '{name}' on {address}: {source}")]
    Bind {
        name: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot adopt inherited listener '{name}': {reason}")]
    Adopt { name: String, reason: String },

    #[error("inherited listener '{name}' is bound to {inherited}, configuration wants {wanted}")]
    AddressMismatch {
        name: String,
        inherited: SocketAddr,
        wanted: SocketAddr,
    },

    #[error("malformed handoff environment: {0}")]
    InvalidInheritance(String),

    #[error("no listeners to export")]
    NothingToExport,

    #[error("failed to spawn successor generation: {0}")]
    Spawn(#[source] io::Error),

    #[error("successor generation (pid {pid}) not ready after {timeout:?}")]
    ReadinessTimeout { pid: u32, timeout: Duration },

    #[error("successor generation (pid {pid}) exited before becoming ready{}", .status.as_ref().map(|s| format!(": {}", s)).unwrap_or_default())]
    SuccessorExited { pid: u32, status: Option<String> },

    #[error("unexpected handoff message 0x{0:02x}")]
    Handshake(u8),

    #[error("generation is {0}, upgrades need an active generation")]
    NotReady(GenerationState),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: GenerationState,
        to: GenerationState,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl HandoffError {
    /// Whether this error aborted an upgrade while the generation stays active
    pub fn is_upgrade_failure(&self) -> bool {
        matches!(
            self,
            HandoffError::Spawn(_)
                | HandoffError::ReadinessTimeout { .. }
                | HandoffError::SuccessorExited { .. }
                | HandoffError::Handshake(_)
                | HandoffError::NothingToExport
        )
    }
}
