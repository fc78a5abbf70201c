//! Baton server library
//!
//! Zero-downtime binary upgrades for a long-lived HTTP server. A running
//! generation hands its listening sockets to a freshly started copy of the
//! binary, waits for it to report ready, then stops accepting and lets its
//! open event streams finish before exiting.
//!
//! - **Listener Registry**: named sockets, bound fresh or adopted
//! - **Readiness Gate**: one-shot "accepting connections" latch
//! - **Drain Controller**: tracks long-lived connections, enforces the grace period
//! - **Generation Manager**: lifecycle state machine and the upgrade sequence
//! - **Triggers**: SIGHUP/SIGTERM/SIGINT and the admin control socket
//! - **HTTP Harness**: static page plus a server-sent event stream
//!
//! # Example
//!
//! ```ignore
//! use baton_server::{GenerationManager, GenerationSettings, SuccessorCommand};
//!
//! let settings = GenerationSettings::from_config(&config.lifecycle, SuccessorCommand::current_process()?);
//! let manager = GenerationManager::from_env(settings)?;
//! let listener = manager.registry().listen("http", "127.0.0.1:8080")?;
//! manager.mark_listening()?;
//! manager.signal_ready().await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod control;
pub mod drain;
pub mod errors;
pub mod generation;
pub mod handoff;
pub mod harness;
pub mod listeners;
pub mod pidfile;
pub mod readiness;
pub mod signals;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use control::{ControlCommand, ControlServer};
pub use drain::{DrainController, DrainOutcome, TrackedConnection};
pub use errors::HandoffError;
pub use generation::{
    GenerationManager, GenerationSettings, HardExitAction, StatusReport, UpgradeOutcome,
};
pub use handoff::{Inheritance, PredecessorLink, SuccessorCommand, SuccessorProcess};
pub use harness::{HarnessConfig, HttpHarness};
pub use listeners::{ListenerInfo, ListenerOrigin, ListenerRegistry};
pub use readiness::{ReadinessGate, ReadyNotifier};
pub use signals::{trigger_channel, SignalTrigger, TriggerEvent, TriggerSender};
