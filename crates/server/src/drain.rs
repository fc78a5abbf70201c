//! Connection draining.
//!
//! Tracks the long-lived connections of a generation and coordinates their
//! shutdown once a successor has taken over the accept path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use baton_common::{ConnectionId, ExitStatus};

/// A tracked long-lived connection
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub opened_at: Instant,
    /// Cancelled to force the connection closed
    cancel: CancellationToken,
}

impl ConnectionRecord {
    /// Cleared once a force close was requested
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Result of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every tracked connection finished inside the grace period
    Drained { elapsed: Duration },
    /// The grace period elapsed; `forced` connections were cut
    TimedOut { forced: usize, elapsed: Duration },
}

impl DrainOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        match *self {
            DrainOutcome::Drained { .. } => ExitStatus::Clean,
            DrainOutcome::TimedOut { forced, .. } => ExitStatus::DrainTimeout { forced },
        }
    }
}

/// Drain controller
///
/// Owns the records of in-flight streaming connections and the accept-path
/// shutdown signal of its generation.
pub struct DrainController {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    next_id: AtomicU64,
    /// Number of tracked connections, published for drain waiters
    active: watch::Sender<usize>,
    /// Cancelled when the accept path closes
    accept: CancellationToken,
    draining: AtomicBool,
}

impl DrainController {
    pub fn new() -> Self {
        debug!("Creating drain controller");
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            active: watch::Sender::new(0),
            accept: CancellationToken::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Start tracking a connection; `cancel` is fired to force it closed
    pub fn track_connection(&self, cancel: CancellationToken) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionRecord {
                id,
                opened_at: Instant::now(),
                cancel,
            },
        );
        self.publish_count();
        trace!(connection = %id, active = self.active_count(), "Connection tracked");
        id
    }

    /// Stop tracking a connection; `false` if it was not tracked
    pub fn untrack(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, record)) => {
                self.publish_count();
                trace!(
                    connection = %id,
                    lifetime_ms = record.opened_at.elapsed().as_millis(),
                    active = self.active_count(),
                    "Connection untracked"
                );
                true
            }
            None => false,
        }
    }

    /// Track a connection for as long as the returned guard lives
    pub fn track(self: &Arc<Self>, cancel: CancellationToken) -> TrackedConnection {
        let id = self.track_connection(cancel.clone());
        TrackedConnection {
            controller: Arc::clone(self),
            id,
            cancel,
        }
    }

    // Read from the map itself so an interleaved insert and removal cannot
    // leave the published count off by one.
    fn publish_count(&self) {
        self.active.send_if_modified(|count| {
            let current = self.connections.len();
            if *count == current {
                false
            } else {
                *count = current;
                true
            }
        });
    }

    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    /// Snapshot of when each tracked connection opened
    pub fn records(&self) -> Vec<(ConnectionId, Instant, bool)> {
        self.connections
            .iter()
            .map(|entry| (entry.id, entry.opened_at, entry.is_live()))
            .collect()
    }

    /// Token cancelled once the accept path closes
    pub fn accept_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    pub fn is_accepting(&self) -> bool {
        !self.accept.is_cancelled()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Close the accept path. Listeners stay open. Idempotent.
    pub fn stop_accepting(&self) {
        if !self.accept.is_cancelled() {
            info!(
                active_connections = self.active_count(),
                "Closing accept path"
            );
            self.accept.cancel();
        }
    }

    /// Stop accepting, then wait for tracked connections to finish.
    ///
    /// Connections still open after `grace` are force-closed.
    pub async fn begin_drain(&self, grace: Duration) -> DrainOutcome {
        self.draining.store(true, Ordering::SeqCst);
        self.stop_accepting();

        let start = Instant::now();
        let initial_count = self.active_count();

        info!(
            active_connections = initial_count,
            grace_secs = grace.as_secs_f64(),
            "Starting connection drain"
        );

        let mut rx = self.active.subscribe();
        let mut last_logged_count = initial_count;
        let drained = async {
            loop {
                let current = *rx.borrow_and_update();
                if current == 0 {
                    return;
                }
                if current != last_logged_count {
                    debug!(
                        remaining_connections = current,
                        elapsed_ms = start.elapsed().as_millis(),
                        "Draining connections"
                    );
                    last_logged_count = current;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        match tokio::time::timeout(grace, drained).await {
            Ok(()) => {
                info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    initial_connections = initial_count,
                    "All connections drained"
                );
                DrainOutcome::Drained {
                    elapsed: start.elapsed(),
                }
            }
            Err(_) => {
                let forced = self.force_close_all();
                warn!(
                    forced_connections = forced,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain grace period elapsed, force-closed remaining connections"
                );
                DrainOutcome::TimedOut {
                    forced,
                    elapsed: start.elapsed(),
                }
            }
        }
    }

    /// Force-close and forget every tracked connection; returns how many
    pub fn force_close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| entry.id).collect();
        let mut forced = 0;
        for id in ids {
            if let Some((_, record)) = self.connections.remove(&id) {
                record.cancel.cancel();
                self.publish_count();
                debug!(
                    connection = %id,
                    lifetime_ms = record.opened_at.elapsed().as_millis(),
                    "Force-closing connection"
                );
                forced += 1;
            }
        }
        forced
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection tracked until dropped
pub struct TrackedConnection {
    controller: Arc<DrainController>,
    id: ConnectionId,
    cancel: CancellationToken,
}

impl TrackedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves when the connection is force-closed
    pub async fn force_closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.controller.untrack(self.id);
    }
}
