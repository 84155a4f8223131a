//! Bookkeeping for everything the listener has started.
//!
//! Three sets keyed by connection id:
//! - pending: accepted connections that have not finished the handshake
//! - handshakes: in-flight handshake tasks
//! - sessions: running relay sessions
//!
//! A connection id moves from `pending` to `sessions` when its handshake
//! succeeds and is never in both. Entries are removed by the work itself when
//! it finishes, or by the reaper when it notices a finished unit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::worker::WorkHandle;

/// Identity of one accepted connection.
pub type ConnId = u64;

/// An accepted connection still in its handshake.
#[derive(Debug)]
pub struct PendingConn {
    pub peer: SocketAddr,
    pub accepted_at: Instant,
    close: CancellationToken,
}

impl PendingConn {
    /// Force the connection closed. The handshake task owning the socket
    /// observes this and shuts it down.
    pub fn close(&self) {
        self.close.cancel();
    }
}

/// Counts of entries removed by one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reaped {
    pub handshakes: usize,
    pub sessions: usize,
}

impl Reaped {
    pub fn total(&self) -> usize {
        self.handshakes + self.sessions
    }
}

/// Shared by the accept loop, handshake tasks and the reaper.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    pending: DashMap<ConnId, PendingConn>,
    handshakes: DashMap<ConnId, WorkHandle>,
    sessions: DashMap<ConnId, WorkHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Pending connections ──────────────────────────────────────────────────

    /// Record an accepted connection. Returns the token that fires when the
    /// connection must be force-closed.
    pub fn add_pending(&self, id: ConnId, peer: SocketAddr) -> CancellationToken {
        let close = CancellationToken::new();
        self.pending.insert(
            id,
            PendingConn {
                peer,
                accepted_at: Instant::now(),
                close: close.clone(),
            },
        );
        close
    }

    pub fn remove_pending(&self, id: ConnId) -> Option<PendingConn> {
        self.pending.remove(&id).map(|(_, p)| p)
    }

    /// Force-close every pending connection. Returns how many were closed.
    pub fn close_pending(&self) -> usize {
        let ids: Vec<ConnId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(conn) = self.remove_pending(id) {
                conn.close();
                closed += 1;
            }
        }
        closed
    }

    // ── Handshake tasks ──────────────────────────────────────────────────────

    pub fn add_handshake(&self, id: ConnId, handle: WorkHandle) {
        self.handshakes.insert(id, handle);
    }

    pub fn remove_handshake(&self, id: ConnId) -> Option<WorkHandle> {
        self.handshakes.remove(&id).map(|(_, h)| h)
    }

    /// Remove and return every handshake task.
    pub fn take_handshakes(&self) -> Vec<(ConnId, WorkHandle)> {
        take_all(&self.handshakes)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Move a connection from pending to the active sessions.
    pub fn promote(&self, id: ConnId, handle: WorkHandle) {
        self.pending.remove(&id);
        self.sessions.insert(id, handle);
    }

    pub fn remove_session(&self, id: ConnId) -> Option<WorkHandle> {
        self.sessions.remove(&id).map(|(_, h)| h)
    }

    /// Remove and return every session.
    pub fn take_sessions(&self) -> Vec<(ConnId, WorkHandle)> {
        take_all(&self.sessions)
    }

    pub fn session_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // ── Counts ───────────────────────────────────────────────────────────────

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn handshake_len(&self) -> usize {
        self.handshakes.len()
    }

    pub fn session_len(&self) -> usize {
        self.sessions.len()
    }

    /// Units the reaper has to look at.
    pub fn tracked(&self) -> usize {
        self.handshake_len() + self.session_len()
    }

    // ── Reaping ──────────────────────────────────────────────────────────────

    /// Remove finished handshake tasks and sessions.
    ///
    /// Each unit gets up to `join_timeout` to finish; all joins run
    /// concurrently so one sweep costs at most one timeout.
    pub async fn reap(&self, join_timeout: Duration) -> Reaped {
        Reaped {
            handshakes: reap_set(&self.handshakes, join_timeout).await,
            sessions: reap_set(&self.sessions, join_timeout).await,
        }
    }
}

fn snapshot(set: &DashMap<ConnId, WorkHandle>) -> Vec<(ConnId, WorkHandle)> {
    set.iter().map(|e| (*e.key(), e.value().clone())).collect()
}

fn take_all(set: &DashMap<ConnId, WorkHandle>) -> Vec<(ConnId, WorkHandle)> {
    let ids: Vec<ConnId> = set.iter().map(|e| *e.key()).collect();
    ids.into_iter().filter_map(|id| set.remove(&id)).collect()
}

async fn reap_set(set: &DashMap<ConnId, WorkHandle>, join_timeout: Duration) -> usize {
    // Never hold a shard lock across the joins.
    let units = snapshot(set);
    let finished = join_all(units.iter().map(|(_, h)| h.join_timeout(join_timeout))).await;

    let mut removed = 0;
    for ((id, _), done) in units.iter().zip(finished) {
        if done && set.remove(id).is_some() {
            removed += 1;
        }
    }
    removed
}

/// Periodically reap finished units until `keep_going` is cancelled, then do
/// one last sweep.
pub async fn reaper_loop(
    registry: Arc<Registry>,
    keep_going: CancellationToken,
    grace: Duration,
    interval: Duration,
    join_timeout: Duration,
) {
    tokio::select! {
        _ = keep_going.cancelled() => {}
        _ = tokio::time::sleep(grace) => {
            loop {
                let reaped = registry.reap(join_timeout).await;
                if reaped.total() > 0 {
                    tracing::debug!(
                        handshakes = reaped.handshakes,
                        sessions = reaped.sessions,
                        "reaped finished units"
                    );
                }
                tokio::select! {
                    biased;
                    _ = keep_going.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    let reaped = registry.reap(join_timeout).await;
    tracing::debug!(
        handshakes = reaped.handshakes,
        sessions = reaped.sessions,
        remaining = registry.tracked(),
        "reaper stopped"
    );
}
