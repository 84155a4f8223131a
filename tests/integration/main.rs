//! Gatekeeper integration test harness.
//!
//! Every test runs a real listener on loopback with an OS-assigned port,
//! in front of mock endpoints that also listen on loopback:
//!
//!   cargo test --test integration
//!
//! Mock endpoints greet each connection with their name on one line and
//! then echo everything they receive, keeping a copy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use gatekeeper_core::config::ShutdownConfig;
use gatekeeper_core::{digest_of, Endpoint, GatekeeperConfig, MappingTable};
use gatekeeper_relay::{handshake, Lifecycle, Listener, ListenerHandle, Session};

mod filters;
mod routing;
mod shutdown;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ALPHA: &[u8] = b"alpha-secret";
pub const BETA: &[u8] = b"beta-secret";

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Loopback config with a small key and fast shutdown timings.
pub fn test_config() -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.listen.addr = "127.0.0.1".into();
    config.listen.port = 0;
    config.handshake.key_bits = 1024;
    config.shutdown = ShutdownConfig {
        reaper_grace_ms: 50,
        reaper_interval_ms: 50,
        join_timeout_ms: 20,
        drain_base_ms: 300,
        terminate_grace_ms: 100,
        kill_grace_ms: 100,
        final_delay_ms: 50,
    };
    config
}

/// A mock backend service.
pub struct MockEndpoint {
    pub endpoint: Endpoint,
    pub connections: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<u8>>>,
}

impl MockEndpoint {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

/// Start a mock endpoint that greets with `name\n` and then echoes.
pub async fn mock_endpoint(name: &str) -> MockEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let greeting = format!("{name}\n").into_bytes();

    let (conns, recv) = (connections.clone(), received.clone());
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            conns.fetch_add(1, Ordering::SeqCst);
            let recv = recv.clone();
            let greeting = greeting.clone();
            tokio::spawn(async move {
                if stream.write_all(&greeting).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            recv.lock().unwrap().extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    MockEndpoint {
        endpoint: Endpoint::new("127.0.0.1", port),
        connections,
        received,
    }
}

/// An endpoint nothing listens on.
pub async fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

pub fn table(entries: &[(&[u8], &Endpoint)]) -> MappingTable {
    MappingTable::from_entries(
        entries
            .iter()
            .map(|(secret, endpoint)| (digest_of(secret), (*endpoint).clone())),
    )
    .unwrap()
}

/// A listener running in the background.
pub struct Running {
    pub handle: ListenerHandle,
    pub addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

impl Running {
    /// Shut down and wait for the listener to exit.
    pub async fn stop(self) -> Result<()> {
        self.handle.shutdown();
        let state = tokio::time::timeout(WAIT, self.handle.wait_for(Lifecycle::Exited))
            .await
            .context("listener did not reach Exited")?;
        assert_eq!(state, Lifecycle::Exited);
        self.task.await.context("listener task panicked")?
    }
}

pub async fn start(config: GatekeeperConfig, mappings: MappingTable) -> Running {
    start_with(Listener::new(config, mappings)).await
}

pub async fn start_with_hook<F>(config: GatekeeperConfig, mappings: MappingTable, hook: F) -> Running
where
    F: Fn(&mut Session, &str, &Endpoint) + Send + Sync + 'static,
{
    start_with(Listener::new(config, mappings).with_filter_hook(hook)).await
}

async fn start_with(listener: Listener) -> Running {
    let handle = listener.handle();
    let task = tokio::spawn(listener.run());
    let addr = tokio::time::timeout(WAIT, handle.local_addr())
        .await
        .expect("listener did not bind in time")
        .expect("listener stopped before binding");
    Running { handle, addr, task }
}

/// Connect and authenticate with `secret`.
pub async fn connect(addr: SocketAddr, secret: &[u8]) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await.context("connect")?;
    tokio::time::timeout(WAIT, handshake::authenticate(&mut stream, secret))
        .await
        .context("handshake timed out")??;
    Ok(stream)
}

/// Read exactly `n` bytes or fail.
pub async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Read until the peer closes. Connection resets count as closed.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = tokio::time::timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("peer did not close in time");
        match read {
            Ok(0) | Err(_) => return buf,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Poll `cond` until it holds or [`WAIT`] passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
