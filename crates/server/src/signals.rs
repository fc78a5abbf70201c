//! Upgrade and shutdown triggers.
//!
//! Bridges OS signals with the async runtime: SIGHUP requests an upgrade,
//! SIGTERM and SIGINT a graceful shutdown. Other trigger sources (the admin
//! control socket, embedding code) feed the same channel.

use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use baton_common::{TriggerSource, UpgradeRequest};

use crate::generation::{StatusReport, UpgradeOutcome};

/// What a signal asks the generation to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Start a successor (SIGHUP)
    Upgrade,
    /// Drain and exit (SIGTERM/SIGINT)
    Shutdown,
}

impl SignalAction {
    pub fn from_signal(signal: i32) -> Option<Self> {
        match signal {
            SIGHUP => Some(SignalAction::Upgrade),
            SIGTERM | SIGINT => Some(SignalAction::Shutdown),
            _ => None,
        }
    }
}

/// Name of a handled signal, for logs and trigger sources
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGHUP => "SIGHUP",
        SIGTERM => "SIGTERM",
        SIGINT => "SIGINT",
        _ => "UNKNOWN",
    }
}

/// Reply channel of an upgrade trigger
pub type UpgradeReply = oneshot::Sender<Result<UpgradeOutcome, String>>;

/// A request delivered to the generation manager
#[derive(Debug)]
pub enum TriggerEvent {
    Upgrade {
        request: UpgradeRequest,
        reply: Option<UpgradeReply>,
    },
    Shutdown {
        source: TriggerSource,
        reply: Option<oneshot::Sender<()>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

impl TriggerEvent {
    pub fn upgrade(source: TriggerSource) -> Self {
        TriggerEvent::Upgrade {
            request: UpgradeRequest::new(source),
            reply: None,
        }
    }

    pub fn shutdown(source: TriggerSource) -> Self {
        TriggerEvent::Shutdown {
            source,
            reply: None,
        }
    }

    /// Event a handled signal maps to
    pub fn from_signal(signal: i32) -> Option<Self> {
        let source = TriggerSource::Signal(signal_name(signal).to_string());
        SignalAction::from_signal(signal).map(|action| match action {
            SignalAction::Upgrade => TriggerEvent::upgrade(source),
            SignalAction::Shutdown => TriggerEvent::shutdown(source),
        })
    }
}

pub type TriggerSender = mpsc::UnboundedSender<TriggerEvent>;
pub type TriggerReceiver = mpsc::UnboundedReceiver<TriggerEvent>;

pub fn trigger_channel() -> (TriggerSender, TriggerReceiver) {
    mpsc::unbounded_channel()
}

/// Signal trigger
///
/// Owns the signal-hook iterator thread. Registration replaces the default
/// dispositions, so a SIGHUP or SIGTERM arriving during startup is queued
/// instead of killing the process.
pub struct SignalTrigger {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalTrigger {
    /// Install handlers and forward events to `tx`
    pub fn install(tx: TriggerSender) -> io::Result<Self> {
        let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT])?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("baton-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let Some(event) = TriggerEvent::from_signal(signal) else {
                        continue;
                    };
                    info!(signal = signal_name(signal), "Received signal");
                    if tx.send(event).is_err() {
                        debug!("Trigger channel closed, stopping signal thread");
                        break;
                    }
                }
                trace!("Signal thread exiting");
            })?;

        debug!("Installed SIGHUP, SIGTERM and SIGINT handlers");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop the signal thread
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalTrigger {
    fn drop(&mut self) {
        self.shutdown();
    }
}
