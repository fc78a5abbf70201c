//! Common types shared across the Baton crates.
//!
//! - [`ids`]: type-safe identifiers for generations and tracked connections
//! - [`types`]: lifecycle state machine, triggers and exit statuses
//! - [`observability`]: tracing subscriber setup used by the binary

pub mod ids;
pub mod observability;
pub mod types;

pub use ids::{ConnectionId, GenerationId};
pub use types::{ExitStatus, GenerationState, TriggerSource, UpgradeRequest};
