//! Lifecycle types shared by the orchestrator and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Generation State
// ============================================================================

/// Lifecycle state of one process generation.
///
/// ```text
/// Starting -> Listening -> Ready -> Active -> Draining -> Exited
/// ```
///
/// Startup failures jump straight to `Exited`, and a shutdown requested
/// between `Ready` and `Active` may go straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    /// Process started, sockets not yet bound or adopted
    Starting,
    /// Every configured listener is bound or adopted
    Listening,
    /// The server harness accepts connections and readiness was signalled
    Ready,
    /// Sole owner of the accept path
    Active,
    /// Accept path closed, waiting for long-lived connections to finish
    Draining,
    /// Terminal state
    Exited,
}

impl GenerationState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: GenerationState) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Starting, Listening)
                | (Listening, Ready)
                | (Ready, Active)
                | (Ready, Draining)
                | (Active, Draining)
                | (Draining, Exited)
                | (Starting, Exited)
                | (Listening, Exited)
                | (Ready, Exited)
        )
    }

    /// The generation no longer takes part in upgrades
    pub fn is_winding_down(self) -> bool {
        matches!(self, GenerationState::Draining | GenerationState::Exited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationState::Starting => "starting",
            GenerationState::Listening => "listening",
            GenerationState::Ready => "ready",
            GenerationState::Active => "active",
            GenerationState::Draining => "draining",
            GenerationState::Exited => "exited",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// What caused an upgrade or shutdown request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TriggerSource {
    /// An OS signal, by name (e.g. `SIGHUP`)
    Signal(String),
    /// A command received on the admin control socket
    Admin,
    /// A direct call from embedding code
    Api,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Signal(name) => write!(f, "signal:{}", name),
            TriggerSource::Admin => f.write_str("admin"),
            TriggerSource::Api => f.write_str("api"),
        }
    }
}

/// A request to replace the running generation.
///
/// Carries no payload beyond when it was made and what made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub requested_at: DateTime<Utc>,
    pub source: TriggerSource,
}

impl UpgradeRequest {
    pub fn new(source: TriggerSource) -> Self {
        Self {
            requested_at: Utc::now(),
            source,
        }
    }
}

// ============================================================================
// Exit Status
// ============================================================================

/// How a generation ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExitStatus {
    /// Every tracked connection finished inside the grace period
    Clean,
    /// The grace period elapsed and surviving connections were force-closed
    DrainTimeout { forced: usize },
    /// The generation never became ready
    StartupFailure,
    /// The hard-exit watchdog fired after the drain deadline
    HardExit,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::StartupFailure => 1,
            ExitStatus::DrainTimeout { .. } => 2,
            ExitStatus::HardExit => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use GenerationState::*;
        let path = [Starting, Listening, Ready, Active, Draining, Exited];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejected_transitions() {
        use GenerationState::*;
        assert!(!Active.can_transition_to(Ready));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Exited.can_transition_to(Starting));
        assert!(!Starting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Exited));
    }

    #[test]
    fn test_startup_failure_transitions() {
        use GenerationState::*;
        assert!(Starting.can_transition_to(Exited));
        assert!(Listening.can_transition_to(Exited));
        assert!(Ready.can_transition_to(Exited));
    }

    #[test]
    fn test_state_predicates() {
        assert!(GenerationState::Draining.is_winding_down());
        assert!(!GenerationState::Active.is_winding_down());
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(TriggerSource::Signal("SIGHUP".into()).to_string(), "signal:SIGHUP");
        assert_eq!(TriggerSource::Admin.to_string(), "admin");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::StartupFailure.code(), 1);
        assert_eq!(ExitStatus::DrainTimeout { forced: 3 }.code(), 2);
        assert_eq!(ExitStatus::HardExit.code(), 3);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&GenerationState::Draining).unwrap();
        assert_eq!(json, "\"draining\"");
    }
}
