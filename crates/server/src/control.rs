//! Admin control socket.
//!
//! A Unix socket accepting one command per line:
//!
//! - `upgrade`: start a successor, reply once it took over or failed
//! - `stop`: drain and exit
//! - `status`: JSON snapshot of the generation
//!
//! Every reply is a single JSON line.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use baton_common::{TriggerSource, UpgradeRequest};

use crate::signals::{TriggerEvent, TriggerSender};

/// Longest accepted command line
const MAX_COMMAND_BYTES: u64 = 1024;

/// A parsed admin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Upgrade,
    Stop,
    Status,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "upgrade" | "reload" => Some(ControlCommand::Upgrade),
            "stop" | "shutdown" => Some(ControlCommand::Stop),
            "status" => Some(ControlCommand::Status),
            _ => None,
        }
    }
}

/// Admin control server
pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
    triggers: TriggerSender,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file.
    ///
    /// A successor binds the same path as its predecessor; the file left
    /// behind by an exiting generation is never removed by it.
    pub fn bind(path: impl AsRef<Path>, triggers: TriggerSender) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            debug!(path = %path.display(), "Removing existing control socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Control socket listening");
        Ok(Self {
            path,
            listener,
            triggers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve commands until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let triggers = self.triggers.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, triggers).await {
                                debug!(error = %e, "Control connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept control connection");
                    }
                },
            }
        }
        debug!(path = %self.path.display(), "Control socket closed");
    }
}

async fn handle_connection(stream: UnixStream, triggers: TriggerSender) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut line = String::new();
        let read = (&mut reader)
            .take(MAX_COMMAND_BYTES)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }

        let reply = match ControlCommand::parse(&line) {
            Some(command) => {
                info!(command = ?command, "Control command received");
                execute(command, &triggers).await
            }
            None => {
                warn!(command = %line.trim(), "Unknown control command");
                json!({ "ok": false, "error": format!("unknown command '{}'", line.trim()) })
            }
        };

        let mut encoded = reply.to_string();
        encoded.push('\n');
        write.write_all(encoded.as_bytes()).await?;
    }
}

async fn execute(command: ControlCommand, triggers: &TriggerSender) -> Value {
    let unavailable = || json!({ "ok": false, "error": "generation is shutting down" });

    match command {
        ControlCommand::Upgrade => {
            let (reply, response) = oneshot::channel();
            let event = TriggerEvent::Upgrade {
                request: UpgradeRequest::new(TriggerSource::Admin),
                reply: Some(reply),
            };
            if triggers.send(event).is_err() {
                return unavailable();
            }
            match response.await {
                Ok(Ok(outcome)) => json!({ "ok": true, "result": outcome }),
                Ok(Err(message)) => json!({ "ok": false, "error": message }),
                Err(_) => unavailable(),
            }
        }
        ControlCommand::Stop => {
            let (reply, response) = oneshot::channel();
            let event = TriggerEvent::Shutdown {
                source: TriggerSource::Admin,
                reply: Some(reply),
            };
            if triggers.send(event).is_err() || response.await.is_err() {
                return unavailable();
            }
            json!({ "ok": true })
        }
        ControlCommand::Status => {
            let (reply, response) = oneshot::channel();
            if triggers.send(TriggerEvent::Status { reply }).is_err() {
                return unavailable();
            }
            match response.await {
                Ok(report) => json!({ "ok": true, "status": report }),
                Err(_) => unavailable(),
            }
        }
    }
}
