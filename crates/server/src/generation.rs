//! Generation manager.
//!
//! Drives one process generation through its lifecycle and, on request,
//! hands the accept path to a successor:
//!
//! ```text
//! Active --trigger--> export listeners --> spawn successor --> wait ready
//!    ^                                                            |
//!    +---- successor failed: kill it, stay active                 |
//!                                                                 v
//!                        Exited <-- drain streams <-- stop accepting, ack
//! ```
//!
//! At most one upgrade runs at a time; triggers arriving while one is in
//! flight are coalesced into it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use baton_common::{ExitStatus, GenerationId, GenerationState, TriggerSource, UpgradeRequest};
use baton_config::LifecycleConfig;

use crate::drain::DrainController;
use crate::errors::HandoffError;
use crate::handoff::{Acknowledgement, Inheritance, PredecessorLink, SuccessorCommand, SuccessorProcess};
use crate::listeners::{HandleSet, ListenerInfo, ListenerRegistry};
use crate::pidfile::write_pid_file;
use crate::readiness::ReadinessGate;
use crate::signals::{TriggerEvent, TriggerReceiver};

/// What the hard exit watchdog does once its deadline passes
#[derive(Clone)]
pub struct HardExitAction(Arc<dyn Fn(ExitStatus) + Send + Sync>);

impl HardExitAction {
    pub fn new(action: impl Fn(ExitStatus) + Send + Sync + 'static) -> Self {
        Self(Arc::new(action))
    }

    /// Terminate the process with the status code
    pub fn exit_process() -> Self {
        Self::new(|status| std::process::exit(status.code()))
    }

    fn fire(&self, status: ExitStatus) {
        (self.0)(status)
    }
}

impl Default for HardExitAction {
    fn default() -> Self {
        Self::exit_process()
    }
}

impl std::fmt::Debug for HardExitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HardExitAction")
    }
}

/// Timing and process settings of a generation
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub drain_grace: Duration,
    /// Extra time past the drain deadline before the process is killed
    /// outright; `None` disables the watchdog
    pub hard_exit: Option<Duration>,
    pub on_hard_exit: HardExitAction,
    pub readiness_timeout: Duration,
    pub pid_file: Option<PathBuf>,
    pub successor: SuccessorCommand,
}

impl GenerationSettings {
    pub fn from_config(lifecycle: &LifecycleConfig, successor: SuccessorCommand) -> Self {
        Self {
            drain_grace: lifecycle.drain_grace(),
            hard_exit: Some(lifecycle.hard_exit()),
            on_hard_exit: HardExitAction::exit_process(),
            readiness_timeout: lifecycle.readiness_timeout(),
            pid_file: lifecycle.pid_file.clone(),
            successor,
        }
    }
}

/// Result of an upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum UpgradeOutcome {
    /// A successor is ready and this generation is draining
    HandedOff { generation: GenerationId, pid: u32 },
    /// Another upgrade was already in flight
    Coalesced,
    /// This generation is already on its way out
    AlreadyDraining,
}

/// Snapshot served by the `status` admin command
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generation: GenerationId,
    pub pid: u32,
    pub state: GenerationState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub parent_pid: Option<u32>,
    pub successor_pid: Option<u32>,
    pub upgrade_in_flight: bool,
    pub tracked_streams: usize,
    pub listeners: Vec<ListenerInfo>,
}

/// Generation manager
pub struct GenerationManager {
    id: GenerationId,
    started_at: DateTime<Utc>,
    settings: GenerationSettings,
    state: watch::Sender<GenerationState>,
    exit: watch::Sender<Option<ExitStatus>>,
    registry: ListenerRegistry,
    readiness: ReadinessGate,
    drain: Arc<DrainController>,
    predecessor: Option<Arc<PredecessorLink>>,
    upgrade_in_flight: AtomicBool,
    successor_pid: Mutex<Option<u32>>,
}

impl GenerationManager {
    /// Create the manager of this process's generation.
    ///
    /// With `inheritance` the generation adopts its predecessor's listeners
    /// and reports readiness back over the handoff channel.
    pub fn new(settings: GenerationSettings, inheritance: Option<Inheritance>) -> Arc<Self> {
        let (id, registry, readiness, predecessor) = match inheritance {
            Some(inherited) => {
                let link = Arc::new(inherited.link);
                (
                    inherited.generation,
                    ListenerRegistry::from_inherited(inherited.listeners),
                    ReadinessGate::with_notifier(link.clone()),
                    Some(link),
                )
            }
            None => (
                GenerationId::FIRST,
                ListenerRegistry::new(),
                ReadinessGate::new(),
                None,
            ),
        };

        debug!(
            generation = %id,
            successor = %settings.successor.program.display(),
            drain_grace_secs = settings.drain_grace.as_secs(),
            readiness_timeout_secs = settings.readiness_timeout.as_secs(),
            "Creating generation manager"
        );

        Arc::new(Self {
            id,
            started_at: Utc::now(),
            settings,
            state: watch::Sender::new(GenerationState::Starting),
            exit: watch::Sender::new(None),
            registry,
            readiness,
            drain: Arc::new(DrainController::new()),
            predecessor,
            upgrade_in_flight: AtomicBool::new(false),
            successor_pid: Mutex::new(None),
        })
    }

    /// Create the manager from the process's handoff environment
    pub fn from_env(settings: GenerationSettings) -> Result<Arc<Self>, HandoffError> {
        let inheritance = Inheritance::from_env()?;
        Ok(Self::new(settings, inheritance))
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn readiness(&self) -> &ReadinessGate {
        &self.readiness
    }

    pub fn drain(&self) -> Arc<DrainController> {
        Arc::clone(&self.drain)
    }

    pub fn is_successor(&self) -> bool {
        self.predecessor.is_some()
    }

    pub fn upgrade_in_flight(&self) -> bool {
        self.upgrade_in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            generation: self.id,
            pid: std::process::id(),
            state: self.state(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            parent_pid: self.predecessor.as_ref().and_then(|link| link.parent_pid()),
            successor_pid: *self.successor_pid.lock(),
            upgrade_in_flight: self.upgrade_in_flight(),
            tracked_streams: self.drain.active_count(),
            listeners: self.registry.listeners(),
        }
    }

    fn transition(&self, to: GenerationState) -> Result<(), HandoffError> {
        let mut from = self.state();
        let changed = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        });

        if !changed {
            return Err(HandoffError::InvalidTransition { from, to });
        }
        info!(generation = %self.id, from = %from, to = %to, "Generation state changed");
        Ok(())
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Every configured listener is bound or adopted
    pub fn mark_listening(&self) -> Result<(), HandoffError> {
        if self.registry.is_empty() {
            return Err(HandoffError::NothingToExport);
        }
        self.transition(GenerationState::Listening)
    }

    /// Report readiness and take over the accept path.
    ///
    /// A successor tells its predecessor it is ready, then waits for the
    /// predecessor to stop accepting. Returns once the generation is active.
    pub async fn signal_ready(&self) -> Result<(), HandoffError> {
        self.transition(GenerationState::Ready)?;

        let closed = self.registry.close_unused_inherited();
        if closed > 0 {
            info!(closed = closed, "Closed inherited listeners no longer configured");
        }
        self.write_pid_file();

        if let Err(e) = self.readiness.signal_ready() {
            warn!(error = %e, "Failed to notify predecessor of readiness");
        }

        if let Some(link) = &self.predecessor {
            match link.wait_acknowledged(self.settings.readiness_timeout).await {
                Acknowledgement::Acknowledged => {
                    info!(parent_pid = ?link.parent_pid(), "Predecessor stopped accepting")
                }
                Acknowledgement::PredecessorGone => {
                    info!(parent_pid = ?link.parent_pid(), "Predecessor is gone")
                }
                Acknowledgement::TimedOut => warn!(
                    parent_pid = ?link.parent_pid(),
                    "No acknowledgement from predecessor, taking over anyway"
                ),
            }
        }

        self.transition(GenerationState::Active)
    }

    /// The generation could not start
    pub fn fail_startup(&self) {
        match self.transition(GenerationState::Exited) {
            Ok(()) => self.finish(ExitStatus::StartupFailure),
            Err(e) => debug!(error = %e, "Startup failure after startup"),
        }
    }

    fn write_pid_file(&self) {
        if let Some(path) = &self.settings.pid_file {
            if let Err(e) = write_pid_file(path, std::process::id()) {
                warn!(path = %path.display(), error = %e, "Failed to write PID file");
            }
        }
    }

    // ========================================================================
    // Upgrade
    // ========================================================================

    /// Replace this generation with a successor.
    ///
    /// On failure the successor is killed and this generation stays active.
    pub async fn request_upgrade(
        self: &Arc<Self>,
        request: UpgradeRequest,
    ) -> Result<UpgradeOutcome, HandoffError> {
        let state = self.state();
        if state.is_winding_down() {
            info!(source = %request.source, state = %state, "Generation is winding down, ignoring upgrade");
            return Ok(UpgradeOutcome::AlreadyDraining);
        }
        if state != GenerationState::Active {
            return Err(HandoffError::NotReady(state));
        }
        if self
            .upgrade_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(source = %request.source, "Upgrade already in progress, coalescing trigger");
            return Ok(UpgradeOutcome::Coalesced);
        }

        info!(
            generation = %self.id,
            source = %request.source,
            requested_at = %request.requested_at,
            "Upgrade requested"
        );

        let result = self.run_upgrade().await;
        self.upgrade_in_flight.store(false, Ordering::Release);

        if let Err(e) = &result {
            error!(generation = %self.id, error = %e, "Upgrade failed, generation stays active");
            self.write_pid_file();
        }
        result
    }

    async fn run_upgrade(self: &Arc<Self>) -> Result<UpgradeOutcome, HandoffError> {
        let handles = self.registry.export()?;
        let mut successor = self.spawn_successor(&handles)?;
        drop(handles);

        self.await_readiness(&mut successor).await?;

        let outcome = UpgradeOutcome::HandedOff {
            generation: successor.generation(),
            pid: successor.pid(),
        };
        self.promote(successor).await?;
        Ok(outcome)
    }

    /// Start the next generation with duplicates of `handles`
    pub fn spawn_successor(&self, handles: &HandleSet) -> Result<SuccessorProcess, HandoffError> {
        self.settings.successor.spawn(handles, self.id.next())
    }

    /// Wait for the successor to report ready; kill it otherwise
    pub async fn await_readiness(&self, successor: &mut SuccessorProcess) -> Result<(), HandoffError> {
        let timeout = self.settings.readiness_timeout;
        info!(
            successor_pid = successor.pid(),
            timeout_secs = timeout.as_secs(),
            "Waiting for successor readiness"
        );

        match successor.wait_ready(timeout).await {
            Ok(()) => {
                info!(successor_pid = successor.pid(), "Successor is ready");
                Ok(())
            }
            Err(e) => {
                warn!(successor_pid = successor.pid(), error = %e, "Successor failed to become ready");
                successor.terminate().await;
                Err(e)
            }
        }
    }

    /// Give the accept path to a ready successor and start draining
    pub async fn promote(self: &Arc<Self>, mut successor: SuccessorProcess) -> Result<(), HandoffError> {
        if let Err(e) = self.transition(GenerationState::Draining) {
            // A shutdown won the race; the successor must not outlive us
            // half-started.
            successor.terminate().await;
            return Err(e);
        }

        self.drain.stop_accepting();
        if let Err(e) = successor.acknowledge().await {
            warn!(successor_pid = successor.pid(), error = %e, "Failed to acknowledge successor");
        }

        *self.successor_pid.lock() = Some(successor.pid());
        info!(
            generation = %self.id,
            successor_generation = %successor.generation(),
            successor_pid = successor.pid(),
            "Handed accept path to successor"
        );
        successor.detach();

        self.start_drain();
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drain and exit without a successor
    pub fn shutdown(self: &Arc<Self>, source: TriggerSource) -> Result<(), HandoffError> {
        let state = self.state();
        if state.is_winding_down() {
            debug!(source = %source, state = %state, "Shutdown already in progress");
            return Ok(());
        }

        info!(generation = %self.id, source = %source, "Shutdown requested");
        self.transition(GenerationState::Draining)?;
        self.drain.stop_accepting();
        self.start_drain();
        Ok(())
    }

    fn start_drain(self: &Arc<Self>) {
        let grace = self.settings.drain_grace;
        if let Some(ceiling) = self.settings.hard_exit {
            arm_hard_exit(grace + ceiling, self.settings.on_hard_exit.clone());
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.drain.begin_drain(grace).await;
            if let Err(e) = manager.transition(GenerationState::Exited) {
                warn!(error = %e, "Drain finished in unexpected state");
            }
            manager.finish(outcome.exit_status());
        });
    }

    fn finish(&self, status: ExitStatus) {
        info!(generation = %self.id, status = ?status, code = status.code(), "Generation finished");
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(status);
                true
            }
        });
    }

    /// Wait for the generation to reach `Exited`
    pub async fn wait_exit(&self) -> ExitStatus {
        let mut rx = self.exit.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status.unwrap_or(ExitStatus::StartupFailure)
    }

    // ========================================================================
    // Trigger loop
    // ========================================================================

    /// Serve triggers until the generation exits
    pub async fn run(self: Arc<Self>, mut triggers: TriggerReceiver) -> ExitStatus {
        let exit = self.wait_exit();
        tokio::pin!(exit);

        loop {
            let event = tokio::select! {
                status = &mut exit => return status,
                event = triggers.recv() => event,
            };

            match event {
                Some(TriggerEvent::Upgrade { request, reply }) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        let source = request.source.clone();
                        let result = manager.request_upgrade(request).await;
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result.map_err(|e| e.to_string()));
                            }
                            None => {
                                if let Err(e) = result {
                                    warn!(source = %source, error = %e, "Upgrade trigger not carried out");
                                }
                            }
                        }
                    });
                }
                Some(TriggerEvent::Shutdown { source, reply }) => {
                    if let Err(e) = self.shutdown(source) {
                        warn!(error = %e, "Shutdown request rejected");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                Some(TriggerEvent::Status { reply }) => {
                    let _ = reply.send(self.status());
                }
                None => {
                    debug!("Trigger channel closed");
                    break;
                }
            }
        }

        exit.await
    }
}

/// Run `action` if the process is still alive after `deadline`.
///
/// Runs on a plain thread so a wedged runtime cannot hold it back.
fn arm_hard_exit(deadline: Duration, action: HardExitAction) {
    let spawned = std::thread::Builder::new()
        .name("baton-hard-exit".to_string())
        .spawn(move || {
            std::thread::sleep(deadline);
            error!(deadline_secs = deadline.as_secs(), "Hard exit deadline reached, terminating");
            action.fire(ExitStatus::HardExit);
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start hard exit watchdog");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pidfile::read_pid_file;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use tokio_util::sync::CancellationToken;

    const READY_SCRIPT: &str = r#"printf R >&"$BATON_HANDOFF_FD"; sleep 2"#;

    fn settings(successor: SuccessorCommand) -> GenerationSettings {
        GenerationSettings {
            drain_grace: Duration::from_secs(2),
            hard_exit: None,
            on_hard_exit: HardExitAction::default(),
            readiness_timeout: Duration::from_secs(5),
            pid_file: None,
            successor,
        }
    }

    // bash, since dash rejects redirections to descriptors above 9
    fn shell(script: &str) -> SuccessorCommand {
        SuccessorCommand::new("bash", ["-c", script])
    }

    async fn active_manager(settings: GenerationSettings) -> Arc<GenerationManager> {
        let manager = GenerationManager::new(settings, None);
        manager.registry().bind("http", "127.0.0.1:0").unwrap();
        manager.mark_listening().unwrap();
        manager.signal_ready().await.unwrap();
        assert_eq!(manager.state(), GenerationState::Active);
        manager
    }

    fn api_request() -> UpgradeRequest {
        UpgradeRequest::new(TriggerSource::Api)
    }

    #[tokio::test]
    async fn test_first_generation_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("baton.pid");
        let mut settings = settings(shell("exit 0"));
        settings.pid_file = Some(pid_path.clone());

        let manager = active_manager(settings).await;
        assert_eq!(manager.id(), GenerationId::FIRST);
        assert!(!manager.is_successor());
        assert!(manager.readiness().is_ready());
        assert_eq!(read_pid_file(&pid_path), Some(std::process::id()));

        let status = manager.status();
        assert_eq!(status.state, GenerationState::Active);
        assert_eq!(status.listeners.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_listening_needs_listeners() {
        let manager = GenerationManager::new(settings(shell("exit 0")), None);
        assert!(matches!(manager.mark_listening(), Err(HandoffError::NothingToExport)));
        assert_eq!(manager.state(), GenerationState::Starting);

        manager.fail_startup();
        assert_eq!(manager.state(), GenerationState::Exited);
        assert_eq!(manager.wait_exit().await, ExitStatus::StartupFailure);
    }

    #[tokio::test]
    async fn test_upgrade_before_active() {
        let manager = GenerationManager::new(settings(shell("exit 0")), None);
        let result = manager.request_upgrade(api_request()).await;
        assert!(matches!(
            result,
            Err(HandoffError::NotReady(GenerationState::Starting))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_generation_active() {
        let manager = active_manager(settings(SuccessorCommand::new(
            "/nonexistent/baton",
            Vec::<String>::new(),
        )))
        .await;

        for _ in 0..2 {
            let result = manager.request_upgrade(api_request()).await;
            assert!(matches!(result, Err(HandoffError::Spawn(_))));
            assert_eq!(manager.state(), GenerationState::Active);
            assert!(!manager.upgrade_in_flight());
        }
    }

    #[tokio::test]
    async fn test_successor_crash_keeps_generation_active() {
        let manager = active_manager(settings(shell("exit 1"))).await;

        let result = manager.request_upgrade(api_request()).await;
        assert!(matches!(result, Err(HandoffError::SuccessorExited { .. })));
        assert_eq!(manager.state(), GenerationState::Active);
        assert!(manager.drain().is_accepting());
    }

    #[tokio::test]
    async fn test_readiness_timeout_restores_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("baton.pid");

        // The stalled successor overwrites the PID file before hanging
        let script = format!("echo $$ > {}; sleep 30", pid_path.display());
        let mut settings = settings(shell(&script));
        settings.pid_file = Some(pid_path.clone());
        settings.readiness_timeout = Duration::from_millis(300);

        let manager = active_manager(settings).await;
        let result = manager.request_upgrade(api_request()).await;
        assert!(matches!(result, Err(HandoffError::ReadinessTimeout { .. })));
        assert_eq!(manager.state(), GenerationState::Active);
        assert_eq!(read_pid_file(&pid_path), Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_coalesced() {
        let mut settings = settings(shell("sleep 30"));
        settings.readiness_timeout = Duration::from_millis(500);
        let manager = active_manager(settings).await;

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.request_upgrade(api_request()).await })
        };
        while !manager.upgrade_in_flight() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = manager.request_upgrade(api_request()).await.unwrap();
        assert_eq!(second, UpgradeOutcome::Coalesced);

        let first = first.await.unwrap();
        assert!(matches!(first, Err(HandoffError::ReadinessTimeout { .. })));
        assert_eq!(manager.state(), GenerationState::Active);
    }

    #[tokio::test]
    async fn test_handoff_with_no_streams_exits_cleanly() {
        let manager = active_manager(settings(shell(READY_SCRIPT))).await;
        let accept = manager.drain().accept_token();

        let outcome = manager.request_upgrade(api_request()).await.unwrap();
        match outcome {
            UpgradeOutcome::HandedOff { generation, pid } => {
                assert_eq!(generation, GenerationId::new(2));
                assert!(pid > 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(accept.is_cancelled());

        assert_eq!(manager.wait_exit().await, ExitStatus::Clean);
        assert_eq!(manager.state(), GenerationState::Exited);
        assert!(manager.status().successor_pid.is_some());

        let again = manager.request_upgrade(api_request()).await.unwrap();
        assert_eq!(again, UpgradeOutcome::AlreadyDraining);
    }

    #[tokio::test]
    async fn test_handoff_waits_for_streams() {
        let manager = active_manager(settings(shell(READY_SCRIPT))).await;
        let drain = manager.drain();
        let guard = drain.track(CancellationToken::new());

        manager.request_upgrade(api_request()).await.unwrap();
        assert_eq!(manager.state(), GenerationState::Draining);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.state(), GenerationState::Draining);
        drop(guard);

        let status = tokio::time::timeout(Duration::from_secs(1), manager.wait_exit())
            .await
            .unwrap();
        assert_eq!(status, ExitStatus::Clean);
    }

    #[tokio::test]
    async fn test_handoff_forces_stuck_streams() {
        let mut settings = settings(shell(READY_SCRIPT));
        settings.drain_grace = Duration::from_millis(300);
        let manager = active_manager(settings).await;

        let token = CancellationToken::new();
        let _guard = manager.drain().track(token.clone());

        manager.request_upgrade(api_request()).await.unwrap();
        assert_eq!(manager.wait_exit().await, ExitStatus::DrainTimeout { forced: 1 });
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_without_successor() {
        let manager = active_manager(settings(shell("exit 0"))).await;
        manager.shutdown(TriggerSource::Signal("SIGTERM".into())).unwrap();
        manager.shutdown(TriggerSource::Signal("SIGTERM".into())).unwrap();
        assert_eq!(manager.wait_exit().await, ExitStatus::Clean);
    }

    #[tokio::test]
    async fn test_successor_waits_for_acknowledgement() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (predecessor, successor_end) = StdUnixStream::pair().unwrap();

        let inheritance = Inheritance {
            generation: GenerationId::new(2),
            parent_pid: Some(1),
            listeners: vec![("http".to_string(), listener.into())],
            link: PredecessorLink::new(successor_end, Some(1)),
        };
        let manager = GenerationManager::new(settings(shell("exit 0")), Some(inheritance));
        assert!(manager.is_successor());
        assert_eq!(manager.id(), GenerationId::new(2));

        manager.registry().listen("http", &address).unwrap();
        manager.mark_listening().unwrap();

        let predecessor = tokio::task::spawn_blocking(move || {
            let mut byte = [0u8; 1];
            (&predecessor).read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], crate::handoff::MSG_READY);
            (&predecessor).write_all(&[crate::handoff::MSG_ACK]).unwrap();
            predecessor
        });

        manager.signal_ready().await.unwrap();
        assert_eq!(manager.state(), GenerationState::Active);
        assert_eq!(manager.status().parent_pid, Some(1));
        drop(predecessor.await.unwrap());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_signal_upgrade_failure_is_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        // Listening but not yet active, so the upgrade is refused
        let manager = GenerationManager::new(settings(shell("exit 0")), None);
        manager.registry().bind("http", "127.0.0.1:0").unwrap();
        manager.mark_listening().unwrap();

        let (tx, rx) = crate::signals::trigger_channel();
        let runner = tokio::spawn(Arc::clone(&manager).run(rx));
        tx.send(TriggerEvent::upgrade(TriggerSource::Signal("SIGHUP".into())))
            .unwrap();

        let mut output = String::new();
        for _ in 0..100 {
            output = logs.contents();
            if output.contains("Upgrade trigger not carried out") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(output.contains("Upgrade trigger not carried out"), "{output}");
        assert!(output.contains("signal:SIGHUP"), "{output}");
        assert_eq!(manager.state(), GenerationState::Listening);
        runner.abort();
    }

    #[tokio::test]
    async fn test_hard_exit_fires_after_drain_deadline() {
        let (fired_tx, fired_rx) = std::sync::mpsc::channel();
        let fired_tx = Mutex::new(fired_tx);

        let mut settings = settings(shell("exit 0"));
        settings.drain_grace = Duration::from_millis(100);
        settings.hard_exit = Some(Duration::from_millis(200));
        settings.on_hard_exit = HardExitAction::new(move |status| {
            let _ = fired_tx.lock().send(status);
        });

        let manager = active_manager(settings).await;
        let _stuck = manager.drain().track(CancellationToken::new());
        manager.shutdown(TriggerSource::Admin).unwrap();
        assert!(fired_rx.try_recv().is_err());

        assert_eq!(manager.wait_exit().await, ExitStatus::DrainTimeout { forced: 1 });
        let fired = tokio::task::spawn_blocking(move || fired_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(fired.unwrap(), ExitStatus::HardExit);
    }

    #[tokio::test]
    async fn test_run_dispatches_triggers() {
        let manager = active_manager(settings(shell("exit 0"))).await;
        let (tx, rx) = crate::signals::trigger_channel();
        let runner = tokio::spawn(Arc::clone(&manager).run(rx));

        let (reply, status) = tokio::sync::oneshot::channel();
        tx.send(TriggerEvent::Status { reply }).unwrap();
        assert_eq!(status.await.unwrap().state, GenerationState::Active);

        let (reply, upgraded) = tokio::sync::oneshot::channel();
        tx.send(TriggerEvent::Upgrade {
            request: api_request(),
            reply: Some(reply),
        })
        .unwrap();
        assert!(upgraded.await.unwrap().is_err());

        tx.send(TriggerEvent::shutdown(TriggerSource::Admin)).unwrap();
        assert_eq!(runner.await.unwrap(), ExitStatus::Clean);
    }
}
