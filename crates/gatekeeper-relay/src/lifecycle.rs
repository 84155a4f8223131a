//! Listener lifecycle and the shutdown escalation for sessions.
//!
//! ```text
//! Running → Draining → Terminating → Exited
//! ```
//!
//! States only move forward. Observers follow them through the watch channel
//! exposed by `ListenerHandle`.

use futures::future::join_all;
use gatekeeper_core::config::ShutdownConfig;

use crate::registry::ConnId;
use crate::worker::WorkHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    /// Accepting connections.
    Running,
    /// No longer accepting; pending connections closed; waiting for the reaper.
    Draining,
    /// Asking live sessions to stop, then killing stragglers.
    Terminating,
    /// Nothing left running.
    Exited,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Terminating => "terminating",
            Lifecycle::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// What happened to each session during [`escalate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationReport {
    /// Already finished before escalation began.
    pub exited: usize,
    /// Stopped after a graceful termination request.
    pub terminated: usize,
    /// Stopped only after being killed.
    pub killed: usize,
    /// Still running after being killed; left to die with the process.
    pub abandoned: usize,
}

impl EscalationReport {
    pub fn total(&self) -> usize {
        self.exited + self.terminated + self.killed + self.abandoned
    }
}

/// Stop every unit: graceful request first, kill for whatever ignores it.
pub async fn escalate(units: Vec<(ConnId, WorkHandle)>, policy: &ShutdownConfig) -> EscalationReport {
    let mut report = EscalationReport::default();

    let (done, mut live): (Vec<_>, Vec<_>) = units.into_iter().partition(|(_, h)| h.is_finished());
    report.exited = done.len();
    if live.is_empty() {
        return report;
    }

    let asked = live.len();
    for (id, handle) in &live {
        tracing::debug!(session = id, unit = handle.label(), "requesting termination");
        handle.terminate();
    }
    tokio::time::sleep(policy.terminate_grace()).await;

    live = still_running(live, policy).await;
    if !live.is_empty() {
        tokio::time::sleep(policy.kill_grace()).await;
        live = still_running(live, policy).await;
    }
    report.terminated = asked - live.len();

    if live.is_empty() {
        return report;
    }

    for (id, handle) in &live {
        tracing::warn!(session = id, unit = handle.label(), "session ignored termination; killing");
        handle.kill();
    }
    tokio::time::sleep(policy.final_delay()).await;

    let survivors = still_running(live.clone(), policy).await;
    report.killed = live.len() - survivors.len();
    report.abandoned = survivors.len();
    for (id, handle) in &survivors {
        tracing::error!(session = id, unit = handle.label(), "session survived kill; abandoning");
    }

    report
}

/// Join every unit briefly and keep the ones that have not finished.
async fn still_running(units: Vec<(ConnId, WorkHandle)>, policy: &ShutdownConfig) -> Vec<(ConnId, WorkHandle)> {
    let join = policy.join_timeout();
    let finished = join_all(units.iter().map(|(_, h)| h.join_timeout(join))).await;
    units
        .into_iter()
        .zip(finished)
        .filter_map(|(unit, done)| (!done).then_some(unit))
        .collect()
}
