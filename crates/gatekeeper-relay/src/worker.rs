//! Two tiers of concurrent work.
//!
//! - [`LightTask`]: a tokio task on the listener's runtime. Cheap, shares the
//!   listener's memory. Used for handshakes and the reaper.
//! - [`IsolatedWorker`]: a dedicated OS thread running its own single-thread
//!   runtime. Used for relay sessions, so a session that panics or hogs its
//!   thread cannot stall the listener or other sessions.
//!
//! Both hand back a [`WorkHandle`] supporting the same liveness checks and the
//! same two-step termination: `terminate()` cancels the token the body was
//! given, `kill()` drops the body wherever it is suspended. Both also run the
//! unit's stop hooks on the caller's thread (see [`WorkHandle::on_stop`]).

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Which tier a unit of work runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Light,
    Isolated,
}

type StopHook = Box<dyn Fn() + Send + Sync>;

/// Handle to a spawned unit of work.
#[derive(Clone)]
pub struct WorkHandle {
    label: Arc<str>,
    tier: Tier,
    shutdown: CancellationToken,
    kill: CancellationToken,
    done: CancellationToken,
    abort: Option<Arc<AbortHandle>>,
    on_stop: Arc<Mutex<Vec<StopHook>>>,
}

impl WorkHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Non-blocking liveness check.
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait up to `timeout` for the unit to finish. Returns true if it did.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.cancelled())
            .await
            .is_ok()
    }

    /// Register `hook` to run whenever the unit is told to stop.
    ///
    /// Hooks run on the thread calling [`terminate`](Self::terminate) or
    /// [`kill`](Self::kill), after the unit's tokens are cancelled, so they
    /// take effect even while the body is stuck. They may run more than once.
    pub fn on_stop(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.on_stop).push(Box::new(hook));
    }

    /// Ask the unit to stop. The body decides how quickly it complies.
    pub fn terminate(&self) {
        self.shutdown.cancel();
        self.run_stop_hooks();
    }

    /// Drop the body at its next suspension point.
    ///
    /// A body stuck in synchronous code never reaches one; such a worker
    /// thread is left to die with the process. Its stop hooks still run.
    pub fn kill(&self) {
        self.kill.cancel();
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        self.run_stop_hooks();
    }

    fn run_stop_hooks(&self) {
        for hook in lock(&self.on_stop).iter() {
            hook();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("label", &self.label)
            .field("tier", &self.tier)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Something that can start a unit of work.
///
/// The body receives a cancellation token that is cancelled by
/// [`WorkHandle::terminate`].
pub trait Spawner {
    fn tier(&self) -> Tier;

    fn spawn<F, Fut>(&self, label: impl Into<String>, body: F) -> io::Result<WorkHandle>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;
}

struct Tokens {
    shutdown: CancellationToken,
    kill: CancellationToken,
    done: CancellationToken,
}

impl Tokens {
    fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    fn handle(&self, label: String, tier: Tier, abort: Option<AbortHandle>) -> WorkHandle {
        WorkHandle {
            label: label.into(),
            tier,
            shutdown: self.shutdown.clone(),
            kill: self.kill.clone(),
            done: self.done.clone(),
            abort: abort.map(Arc::new),
            on_stop: Arc::default(),
        }
    }
}

/// Run `body` until it finishes or `kill` fires. `done` is signalled when the
/// returned future is dropped, whether it completed, was killed, was aborted
/// before its first poll, or unwound from a panic.
fn supervise<Fut>(body: Fut, kill: CancellationToken, done: DropGuard) -> impl Future<Output = ()>
where
    Fut: Future<Output = ()>,
{
    async move {
        let _done = done;
        tokio::select! {
            biased;
            _ = kill.cancelled() => {}
            _ = body => {}
        }
    }
}

// ── Light tier ────────────────────────────────────────────────────────────────

/// Spawns onto an existing tokio runtime.
#[derive(Debug, Clone)]
pub struct LightTask {
    runtime: tokio::runtime::Handle,
}

impl LightTask {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    /// Spawner for the runtime the caller is running on.
    ///
    /// Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Spawner for LightTask {
    fn tier(&self) -> Tier {
        Tier::Light
    }

    fn spawn<F, Fut>(&self, label: impl Into<String>, body: F) -> io::Result<WorkHandle>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tokens = Tokens::new();
        let fut = supervise(
            body(tokens.shutdown.clone()),
            tokens.kill.clone(),
            tokens.done.clone().drop_guard(),
        );
        let task = self.runtime.spawn(fut);
        Ok(tokens.handle(label.into(), Tier::Light, Some(task.abort_handle())))
    }
}

// ── Isolated tier ─────────────────────────────────────────────────────────────

/// Spawns each unit on its own thread with its own runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolatedWorker;

impl Spawner for IsolatedWorker {
    fn tier(&self) -> Tier {
        Tier::Isolated
    }

    fn spawn<F, Fut>(&self, label: impl Into<String>, body: F) -> io::Result<WorkHandle>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let tokens = Tokens::new();
        let shutdown = tokens.shutdown.clone();
        let kill = tokens.kill.clone();
        let done = tokens.done.clone().drop_guard();
        let thread_label = label.clone();

        std::thread::Builder::new()
            .name(format!("gk-{label}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(unit = %thread_label, error = %e, "failed to build worker runtime");
                        drop(done);
                        return;
                    }
                };
                runtime.block_on(supervise(body(shutdown), kill, done));
            })?;

        Ok(tokens.handle(label, Tier::Isolated, None))
    }
}
