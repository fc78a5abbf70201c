//! Process handoff protocol.
//!
//! A predecessor hands its listeners to a successor by duplicating them into
//! a freshly spawned copy of the binary. The names and descriptor numbers
//! travel in the successor's environment, together with one end of a Unix
//! socket pair used for a two-message handshake:
//!
//! 1. the successor writes [`MSG_READY`] once its listeners accept,
//! 2. the predecessor closes its accept path and answers [`MSG_ACK`].
//!
//! End-of-file on the channel means the peer is gone. A successor that
//! never reports ready is killed and the predecessor carries on.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use baton_common::GenerationId;

use crate::errors::HandoffError;
use crate::listeners::HandleSet;
use crate::readiness::ReadyNotifier;

/// `name=fd` pairs, comma separated
pub const ENV_LISTEN_FDS: &str = "BATON_LISTEN_FDS";
/// Successor end of the handshake channel
pub const ENV_HANDOFF_FD: &str = "BATON_HANDOFF_FD";
/// Generation number assigned to the successor
pub const ENV_GENERATION: &str = "BATON_GENERATION";
/// Process id of the predecessor
pub const ENV_PARENT_PID: &str = "BATON_PARENT_PID";

/// Successor to predecessor: listeners are accepting
pub const MSG_READY: u8 = b'R';
/// Predecessor to successor: accept path closed
pub const MSG_ACK: u8 = b'A';

/// How long a failed successor may take to exit after SIGTERM
const TERM_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for a killed successor to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Successor side
// ============================================================================

/// State handed down by a predecessor
pub struct Inheritance {
    pub generation: GenerationId,
    pub parent_pid: Option<u32>,
    pub listeners: Vec<(String, OwnedFd)>,
    pub link: PredecessorLink,
}

impl Inheritance {
    /// Read the handoff environment of this process.
    ///
    /// `Ok(None)` means this is a first generation. The descriptors are
    /// claimed and marked close-on-exec again.
    pub fn from_env() -> Result<Option<Self>, HandoffError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, HandoffError> {
        let Some(handoff) = get(ENV_HANDOFF_FD) else {
            return Ok(None);
        };

        let handoff_fd = parse_fd(&handoff)?;
        let listen_fds = parse_listen_fds(get(ENV_LISTEN_FDS).as_deref().unwrap_or(""))?;
        if listen_fds.iter().any(|(_, fd)| *fd == handoff_fd) {
            return Err(HandoffError::InvalidInheritance(format!(
                "descriptor {} used twice",
                handoff_fd
            )));
        }

        let generation = match get(ENV_GENERATION) {
            Some(value) => value.parse::<GenerationId>().map_err(|_| {
                HandoffError::InvalidInheritance(format!("bad generation '{}'", value))
            })?,
            None => GenerationId::FIRST.next(),
        };
        let parent_pid = get(ENV_PARENT_PID).and_then(|value| value.trim().parse().ok());

        // Check every descriptor before taking ownership of any of them.
        for fd in listen_fds.iter().map(|(_, fd)| *fd).chain([handoff_fd]) {
            set_cloexec(fd).map_err(|e| {
                HandoffError::InvalidInheritance(format!("descriptor {}: {}", fd, e))
            })?;
        }

        // SAFETY: each descriptor is open (checked above), appears once, and
        // nothing else in this process owns it.
        let listeners = listen_fds
            .into_iter()
            .map(|(name, fd)| (name, unsafe { OwnedFd::from_raw_fd(fd) }))
            .collect::<Vec<_>>();
        let channel = StdUnixStream::from(unsafe { OwnedFd::from_raw_fd(handoff_fd) });

        info!(
            generation = %generation,
            parent_pid = ?parent_pid,
            listeners = listeners.len(),
            "Inherited handoff state from predecessor"
        );

        Ok(Some(Self {
            generation,
            parent_pid,
            listeners,
            link: PredecessorLink::new(channel, parent_pid),
        }))
    }
}

/// Parse `name=fd,name=fd`
pub fn parse_listen_fds(value: &str) -> Result<Vec<(String, RawFd)>, HandoffError> {
    let mut seen_names = HashSet::new();
    let mut seen_fds = HashSet::new();
    let mut out = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, fd) = entry.split_once('=').ok_or_else(|| {
            HandoffError::InvalidInheritance(format!("entry '{}' is not name=fd", entry))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HandoffError::InvalidInheritance(format!(
                "entry '{}' has no name",
                entry
            )));
        }
        let fd = parse_fd(fd)?;
        if !seen_names.insert(name.to_string()) {
            return Err(HandoffError::InvalidInheritance(format!(
                "listener '{}' listed twice",
                name
            )));
        }
        if !seen_fds.insert(fd) {
            return Err(HandoffError::InvalidInheritance(format!(
                "descriptor {} used twice",
                fd
            )));
        }
        out.push((name.to_string(), fd));
    }

    Ok(out)
}

fn parse_fd(value: &str) -> Result<RawFd, HandoffError> {
    let fd: RawFd = value
        .trim()
        .parse()
        .map_err(|_| HandoffError::InvalidInheritance(format!("bad descriptor '{}'", value)))?;
    if fd <= 2 {
        return Err(HandoffError::InvalidInheritance(format!(
            "descriptor {} is reserved for stdio",
            fd
        )));
    }
    Ok(fd)
}

/// Acknowledgement result seen by a successor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The predecessor closed its accept path
    Acknowledged,
    /// The predecessor exited or dropped the channel
    PredecessorGone,
    /// Nothing arrived in time
    TimedOut,
}

/// Successor's end of the handshake channel
pub struct PredecessorLink {
    parent_pid: Option<u32>,
    channel: Mutex<Option<StdUnixStream>>,
}

impl PredecessorLink {
    pub fn new(channel: StdUnixStream, parent_pid: Option<u32>) -> Self {
        Self {
            parent_pid,
            channel: Mutex::new(Some(channel)),
        }
    }

    pub fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    /// Wait for the predecessor to confirm it stopped accepting.
    ///
    /// Consumes the channel; later calls report [`Acknowledgement::PredecessorGone`].
    pub async fn wait_acknowledged(&self, timeout: Duration) -> Acknowledgement {
        let Some(channel) = self.channel.lock().take() else {
            return Acknowledgement::PredecessorGone;
        };

        let mut channel = match channel
            .set_nonblocking(true)
            .and_then(|()| UnixStream::from_std(channel))
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Handoff channel unusable");
                return Acknowledgement::PredecessorGone;
            }
        };

        let mut buf = [0u8; 1];
        match tokio::time::timeout(timeout, channel.read(&mut buf)).await {
            Ok(Ok(1)) if buf[0] == MSG_ACK => Acknowledgement::Acknowledged,
            Ok(Ok(1)) => {
                warn!(byte = buf[0], "Unexpected handoff message from predecessor");
                Acknowledgement::PredecessorGone
            }
            Ok(Ok(_)) => Acknowledgement::PredecessorGone,
            Ok(Err(e)) => {
                debug!(error = %e, "Handoff channel read failed");
                Acknowledgement::PredecessorGone
            }
            Err(_) => Acknowledgement::TimedOut,
        }
    }
}

impl ReadyNotifier for PredecessorLink {
    fn notify_ready(&self) -> io::Result<()> {
        let mut guard = self.channel.lock();
        let channel = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        channel.write_all(&[MSG_READY])?;
        debug!(parent_pid = ?self.parent_pid, "Sent readiness to predecessor");
        Ok(())
    }
}

// ============================================================================
// Predecessor side
// ============================================================================

/// Program and arguments used to start a successor
#[derive(Debug, Clone)]
pub struct SuccessorCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl SuccessorCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run this binary with the same arguments.
    ///
    /// Resolve this at startup: once the binary on disk is replaced the
    /// kernel reports the running image as deleted.
    pub fn current_process() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let program = match exe.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
            Some(stripped) => PathBuf::from(stripped),
            None => exe,
        };
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    /// Start a successor that inherits `handles`.
    pub fn spawn(
        &self,
        handles: &HandleSet,
        generation: GenerationId,
    ) -> Result<SuccessorProcess, HandoffError> {
        let (ours, theirs) = StdUnixStream::pair().map_err(HandoffError::Spawn)?;
        let handoff_fd = theirs.as_raw_fd();

        let listen_fds = handles
            .iter()
            .map(|h| format!("{}={}", h.name, h.raw_fd()))
            .collect::<Vec<_>>()
            .join(",");
        let inherit: Vec<RawFd> = handles
            .iter()
            .map(|h| h.raw_fd())
            .chain([handoff_fd])
            .collect();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_LISTEN_FDS, &listen_fds)
            .env(ENV_HANDOFF_FD, handoff_fd.to_string())
            .env(ENV_GENERATION, generation.to_string())
            .env(ENV_PARENT_PID, std::process::id().to_string())
            .stdin(Stdio::null())
            .kill_on_drop(false);

        // SAFETY: the hook only calls fcntl, which is async-signal-safe, and
        // does not allocate.
        unsafe {
            command.pre_exec(move || {
                for fd in &inherit {
                    clear_cloexec(*fd)?;
                }
                Ok(())
            });
        }

        trace!(program = %self.program.display(), listen_fds = %listen_fds, "Spawning successor");
        let child = command.spawn().map_err(HandoffError::Spawn)?;
        drop(theirs);

        let pid = child.id().unwrap_or_default();
        ours.set_nonblocking(true).map_err(HandoffError::Spawn)?;
        let channel = UnixStream::from_std(ours).map_err(HandoffError::Spawn)?;

        info!(
            successor_generation = %generation,
            successor_pid = pid,
            listeners = handles.len(),
            "Spawned successor generation"
        );

        Ok(SuccessorProcess {
            generation,
            pid,
            child,
            channel,
        })
    }
}

enum Wake {
    Message(io::Result<usize>),
    Exited(io::Result<std::process::ExitStatus>),
    Elapsed,
}

/// A spawned successor as seen by its predecessor
pub struct SuccessorProcess {
    generation: GenerationId,
    pid: u32,
    child: Child,
    channel: UnixStream,
}

impl SuccessorProcess {
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the successor's readiness message.
    ///
    /// Fails early if the successor exits or closes the channel first.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), HandoffError> {
        let mut buf = [0u8; 1];
        let wake = tokio::select! {
            biased;
            read = self.channel.read(&mut buf) => Wake::Message(read),
            status = self.child.wait() => Wake::Exited(status),
            _ = tokio::time::sleep(timeout) => Wake::Elapsed,
        };

        match wake {
            Wake::Message(Ok(1)) if buf[0] == MSG_READY => Ok(()),
            Wake::Message(Ok(1)) => Err(HandoffError::Handshake(buf[0])),
            Wake::Message(Ok(_)) => {
                let status = tokio::time::timeout(Duration::from_millis(100), self.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                Err(HandoffError::SuccessorExited {
                    pid: self.pid,
                    status: status.map(|s| s.to_string()),
                })
            }
            Wake::Message(Err(e)) => Err(HandoffError::Io(e)),
            Wake::Exited(status) => Err(HandoffError::SuccessorExited {
                pid: self.pid,
                status: status.ok().map(|s| s.to_string()),
            }),
            Wake::Elapsed => Err(HandoffError::ReadinessTimeout {
                pid: self.pid,
                timeout,
            }),
        }
    }

    /// Tell the successor the accept path is closed
    pub async fn acknowledge(&mut self) -> io::Result<()> {
        self.channel.write_all(&[MSG_ACK]).await
    }

    /// Stop the successor and reap it.
    ///
    /// Asks with SIGTERM first and kills after [`TERM_GRACE`].
    pub async fn terminate(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(successor_pid = self.pid, status = %status, "Successor already exited");
            return;
        }

        if self.pid > 0 {
            if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                debug!(successor_pid = self.pid, error = %e, "Failed to send SIGTERM to successor");
            }
        }
        if let Ok(Ok(status)) = tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            info!(successor_pid = self.pid, status = %status, "Successor terminated");
            return;
        }

        if let Err(e) = self.child.start_kill() {
            debug!(successor_pid = self.pid, error = %e, "Successor already gone");
        }
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(successor_pid = self.pid, status = %status, "Successor killed"),
            Ok(Err(e)) => warn!(successor_pid = self.pid, error = %e, "Failed to reap successor"),
            Err(_) => warn!(successor_pid = self.pid, "Successor did not exit after kill"),
        }
    }

    /// Let the successor run on its own
    pub fn detach(self) {
        debug!(successor_pid = self.pid, "Detached from successor");
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    update_fd_flags(fd, |flags| flags | libc::FD_CLOEXEC)
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    update_fd_flags(fd, |flags| flags & !libc::FD_CLOEXEC)
}

fn update_fd_flags(fd: RawFd, update: impl Fn(libc::c_int) -> libc::c_int) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, update(flags)) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
