//! The listener: bind, accept, authenticate, route, and shut down.
//!
//! Each accepted connection gets a light handshake task. A successful
//! handshake becomes a [`Session`] on an isolated worker. A reaper task
//! sweeps finished units out of the [`Registry`] while the listener runs.
//!
//! Shutdown is driven by the keep-going token (see [`ListenerHandle::shutdown`])
//! and walks the [`Lifecycle`] states in order.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use gatekeeper_core::config::{RelayConfig, ShutdownConfig};
use gatekeeper_core::{Endpoint, GatekeeperConfig, KeyPair, MappingTable};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::handshake::{self, HandshakeError, Route};
use crate::lifecycle::{escalate, Lifecycle};
use crate::registry::{reaper_loop, ConnId, Registry};
use crate::session::{close, Session};
use crate::worker::{IsolatedWorker, LightTask, Spawner, WorkHandle};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Operator hook run on every new session before it starts relaying.
/// Receives the session, the secret's digest and the mapped endpoint.
pub type FilterHook = Arc<dyn Fn(&mut Session, &str, &Endpoint) + Send + Sync>;

pub struct Listener {
    config: GatekeeperConfig,
    mappings: Arc<MappingTable>,
    hook: Option<FilterHook>,
    registry: Arc<Registry>,
    keep_going: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

/// Cloneable control and observation handle for a running [`Listener`].
#[derive(Clone)]
pub struct ListenerHandle {
    keep_going: CancellationToken,
    lifecycle: watch::Receiver<Lifecycle>,
    local_addr: watch::Receiver<Option<SocketAddr>>,
    registry: Arc<Registry>,
}

impl ListenerHandle {
    /// Stop accepting and begin the shutdown sequence.
    pub fn shutdown(&self) {
        self.keep_going.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.keep_going.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Wait until the listener has reached `state` or a later one.
    pub async fn wait_for(&self, state: Lifecycle) -> Lifecycle {
        let mut rx = self.lifecycle.clone();
        let reached = rx.wait_for(|s| *s >= state).await.map(|s| *s);
        reached.unwrap_or(Lifecycle::Exited)
    }

    /// The bound address, once the listener is accepting. `None` if it
    /// stopped before binding.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.local_addr.clone();
        let bound = rx.wait_for(|a| a.is_some()).await.map(|a| *a);
        bound.ok().flatten()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("lifecycle", &self.lifecycle())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Everything a handshake task needs, shared by `Arc`.
struct HandshakeCtx {
    keypair: KeyPair,
    mappings: Arc<MappingTable>,
    registry: Arc<Registry>,
    relay: RelayConfig,
    timeout: Option<Duration>,
    hook: Option<FilterHook>,
    light: LightTask,
    isolated: IsolatedWorker,
}

impl Listener {
    pub fn new(mut config: GatekeeperConfig, mappings: MappingTable) -> Self {
        config.sanitize();
        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let (local_addr, _) = watch::channel(None);
        Self {
            config,
            mappings: Arc::new(mappings),
            hook: None,
            registry: Registry::shared(),
            keep_going: CancellationToken::new(),
            lifecycle,
            local_addr,
        }
    }

    /// Run `hook` on every session before it starts; typically used to
    /// attach extra filters per endpoint.
    pub fn with_filter_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Session, &str, &Endpoint) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            keep_going: self.keep_going.clone(),
            lifecycle: self.lifecycle.subscribe(),
            local_addr: self.local_addr.subscribe(),
            registry: self.registry.clone(),
        }
    }

    /// Serve until shut down. Returns once the listener has reached
    /// [`Lifecycle::Exited`].
    pub async fn run(self) -> Result<()> {
        let bits = self.config.handshake.key_bits;
        let keygen = tokio::task::spawn_blocking(move || KeyPair::generate(bits));

        let Some(socket) = self.bind_with_retry().await else {
            tracing::info!("stopped before binding");
            self.set_state(Lifecycle::Exited);
            return Ok(());
        };

        let keypair = match keygen.await.context("key generation task failed") {
            Ok(Ok(kp)) => kp,
            Ok(Err(e)) => {
                self.set_state(Lifecycle::Exited);
                return Err(e).context("failed to generate key pair");
            }
            Err(e) => {
                self.set_state(Lifecycle::Exited);
                return Err(e);
            }
        };
        tracing::info!(bits, "key pair ready");

        let local = socket.local_addr().context("bound socket has no local address")?;
        self.local_addr.send_replace(Some(local));
        tracing::info!(addr = %local, mappings = self.mappings.len(), "listening");

        let light = LightTask::current();
        let ctx = Arc::new(HandshakeCtx {
            keypair,
            mappings: self.mappings.clone(),
            registry: self.registry.clone(),
            relay: self.config.relay.clone(),
            timeout: self.config.handshake.timeout(),
            hook: self.hook.clone(),
            light: light.clone(),
            isolated: IsolatedWorker,
        });

        let policy = self.config.shutdown.clone();
        let reaper = {
            let registry = self.registry.clone();
            let keep_going = self.keep_going.clone();
            let p = policy.clone();
            light.spawn("reaper", move |_| {
                reaper_loop(registry, keep_going, p.reaper_grace(), p.reaper_interval(), p.join_timeout())
            })?
        };

        let accepted = AssertUnwindSafe(self.accept_loop(socket, &ctx)).catch_unwind().await;
        if accepted.is_err() {
            tracing::error!("accept loop panicked; shutting down");
        }
        self.keep_going.cancel();

        self.drain(&policy, reaper).await;
        self.terminate(&policy).await;
        self.set_state(Lifecycle::Exited);
        Ok(())
    }

    fn set_state(&self, state: Lifecycle) {
        self.lifecycle.send_replace(state);
        tracing::info!(%state, "lifecycle");
    }

    // ── Bind ─────────────────────────────────────────────────────────────────

    async fn bind_with_retry(&self) -> Option<TcpListener> {
        let listen = &self.config.listen;
        loop {
            if self.keep_going.is_cancelled() {
                return None;
            }
            match bind(&listen.addr, listen.port, listen.backlog).await {
                Ok(socket) => return Some(socket),
                Err(e) => tracing::warn!(
                    addr = %listen.addr,
                    port = listen.port,
                    error = %e,
                    retry_in = ?listen.bind_retry(),
                    "bind failed"
                ),
            }
            tokio::select! {
                _ = self.keep_going.cancelled() => return None,
                _ = tokio::time::sleep(listen.bind_retry()) => {}
            }
        }
    }

    // ── Accept ───────────────────────────────────────────────────────────────

    async fn accept_loop(&self, socket: TcpListener, ctx: &Arc<HandshakeCtx>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.keep_going.cancelled() => break,
                r = socket.accept() => r,
            };

            match accepted {
                Ok((stream, peer)) => dispatch(ctx, stream, peer),
                Err(_) if self.keep_going.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = self.keep_going.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!("accept loop stopped");
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    async fn drain(&self, policy: &ShutdownConfig, reaper: WorkHandle) {
        self.set_state(Lifecycle::Draining);

        let closed = self.registry.close_pending();
        let budget = policy.drain_budget(self.registry.tracked());
        tracing::info!(closed_pending = closed, budget = ?budget, "draining");

        if !reaper.join_timeout(budget).await {
            tracing::warn!("reaper did not finish within the drain budget");
            reaper.kill();
        }
    }

    async fn terminate(&self, policy: &ShutdownConfig) {
        self.set_state(Lifecycle::Terminating);

        for (id, handshake) in self.registry.take_handshakes() {
            if !handshake.is_finished() {
                tracing::debug!(conn = id, "killing handshake");
                handshake.kill();
            }
        }

        let sessions = self.registry.take_sessions();
        if sessions.is_empty() {
            return;
        }
        let report = escalate(sessions, policy).await;
        tracing::info!(
            exited = report.exited,
            terminated = report.terminated,
            killed = report.killed,
            abandoned = report.abandoned,
            "sessions stopped"
        );
    }
}

/// Bind a listening socket with `SO_REUSEADDR` and the given backlog.
async fn bind(addr: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let target = tokio::net::lookup_host((addr, port))
        .await
        .with_context(|| format!("resolve {addr}"))?
        .next()
        .with_context(|| format!("{addr} resolved to no addresses"))?;

    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    socket
        .bind(&target.into())
        .with_context(|| format!("bind {target}"))?;
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).context("listen()")?;

    TcpListener::from_std(socket.into()).context("register listener")
}

// ── Handshake tasks ──────────────────────────────────────────────────────────

fn dispatch(ctx: &Arc<HandshakeCtx>, stream: TcpStream, peer: SocketAddr) {
    let id = ctx.registry.next_id();
    let close_token = ctx.registry.add_pending(id, peer);
    tracing::debug!(conn = id, %peer, "accepted");

    let task_ctx = ctx.clone();
    let spawned = ctx.light.spawn(format!("handshake-{id}"), move |stop| {
        handshake_task(task_ctx, id, stream, peer, close_token, stop)
    });
    match spawned {
        Ok(handle) => ctx.registry.add_handshake(id, handle),
        Err(e) => {
            ctx.registry.remove_pending(id);
            tracing::warn!(conn = id, error = %e, "failed to start handshake");
        }
    }
}

async fn handshake_task(
    ctx: Arc<HandshakeCtx>,
    id: ConnId,
    mut stream: TcpStream,
    peer: SocketAddr,
    close_token: CancellationToken,
    stop: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        _ = close_token.cancelled() => None,
        _ = stop.cancelled() => None,
        r = authenticate(&ctx, &mut stream) => Some(r),
    };

    match outcome {
        Some(Ok(route)) if !close_token.is_cancelled() => start_session(&ctx, id, stream, peer, route),
        Some(Ok(_)) | None => {
            close(&stream);
            ctx.registry.remove_pending(id);
            tracing::debug!(conn = id, %peer, "connection closed during handshake");
        }
        Some(Err(e)) => {
            close(&stream);
            ctx.registry.remove_pending(id);
            if e.is_auth_failure() {
                tracing::info!(conn = id, %peer, reason = %e, "authentication failed");
            } else {
                tracing::debug!(conn = id, %peer, error = %e, "handshake failed");
            }
        }
    }

    ctx.registry.remove_handshake(id);
}

async fn authenticate(ctx: &HandshakeCtx, stream: &mut TcpStream) -> Result<Route, HandshakeError> {
    let attempt = handshake::accept(stream, &ctx.keypair, &ctx.mappings);
    match ctx.timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| HandshakeError::Timeout)?,
        None => attempt.await,
    }
}

fn start_session(ctx: &HandshakeCtx, id: ConnId, stream: TcpStream, peer: SocketAddr, route: Route) {
    let client = match stream.into_std() {
        Ok(s) => s,
        Err(e) => {
            ctx.registry.remove_pending(id);
            tracing::debug!(conn = id, error = %e, "could not detach client socket");
            return;
        }
    };

    let Route {
        digest,
        endpoint,
        leftover,
    } = route;
    let mut session =
        Session::new(id, client, peer, endpoint.clone(), &ctx.relay).with_initial_data(leftover);
    if let Some(hook) = &ctx.hook {
        hook(&mut session, &digest, &endpoint);
    }
    tracing::info!(conn = id, %peer, %endpoint, filters = ?session.filters(), "authenticated");

    let sockets = session.sockets();
    let registry = ctx.registry.clone();
    let spawned = ctx.isolated.spawn(format!("session-{id}"), move |stop| async move {
        session.run(stop).await;
        registry.remove_session(id);
    });
    match spawned {
        Ok(handle) => {
            handle.on_stop(move || sockets.close_all());
            ctx.registry.promote(id, handle);
        }
        Err(e) => {
            ctx.registry.remove_pending(id);
            tracing::error!(conn = id, error = %e, "failed to start session worker");
        }
    }
}
