//! One authenticated relay session.
//!
//! A [`Session`] owns the client socket from the moment its handshake
//! succeeds. [`Session::run`] connects to the endpoint and pumps bytes both
//! ways until either side closes, an I/O error occurs, a filter stops the
//! session, or the session is asked to terminate. Both sockets are shut
//! down on the way out.
//!
//! Client → endpoint data passes through the session's [`FilterChain`];
//! endpoint → client data is relayed verbatim.
//!
//! Each session also keeps duplicates of its sockets in [`SessionSockets`],
//! so whoever stops it can shut both connections even if the session is
//! stuck inside a filter.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use gatekeeper_core::config::RelayConfig;
use gatekeeper_core::filter::Stopped;
use gatekeeper_core::{Endpoint, Filter, FilterChain, KeywordIntercept, StripCarriageReturns};
use socket2::{SockRef, Socket};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::handshake::ENDPOINT_ERROR_LINE;
use crate::registry::ConnId;

/// Upper bound on flushing buffered data once one side has gone away.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The endpoint could not be connected.
    Unreachable,
    ClientClosed,
    EndpointClosed,
    ClientError(io::ErrorKind),
    EndpointError(io::ErrorKind),
    /// A filter returned `Stop`.
    Filtered(String),
    /// Termination was requested.
    Terminated,
}

/// Duplicated handles to a session's client and endpoint sockets.
#[derive(Debug, Default)]
pub struct SessionSockets {
    state: Mutex<TrackedSockets>,
}

#[derive(Debug, Default)]
struct TrackedSockets {
    closed: bool,
    sockets: Vec<Socket>,
}

impl SessionSockets {
    /// Keep a duplicate of `sock`. Once [`close_all`](Self::close_all) has
    /// run, new sockets are shut down immediately instead.
    fn track(&self, sock: SockRef<'_>) {
        let dup = match sock.try_clone() {
            Ok(dup) => dup,
            Err(e) => {
                tracing::debug!(error = %e, "could not duplicate session socket");
                return;
            }
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            let _ = dup.shutdown(Shutdown::Both);
        } else {
            state.sockets.push(dup);
        }
    }

    /// Shut every tracked socket down in both directions and release the
    /// duplicates. Idempotent.
    pub fn close_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        for socket in state.sockets.drain(..) {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}

pub struct Session {
    id: ConnId,
    client: std::net::TcpStream,
    client_addr: SocketAddr,
    endpoint: Endpoint,
    client_chunk: usize,
    endpoint_chunk: usize,
    connect_timeout: Option<Duration>,
    filters: FilterChain,
    initial: Vec<u8>,
    sockets: Arc<SessionSockets>,
}

impl Session {
    /// Build a session for an authenticated client, with the base filters the
    /// relay config asks for.
    ///
    /// `client` must be in non-blocking mode, as returned by
    /// `tokio::net::TcpStream::into_std`.
    pub fn new(
        id: ConnId,
        client: std::net::TcpStream,
        client_addr: SocketAddr,
        endpoint: Endpoint,
        relay: &RelayConfig,
    ) -> Self {
        let mut filters = FilterChain::new();
        if relay.intercept_keywords {
            filters.push(KeywordIntercept::new(relay.keywords.iter().cloned()));
        }
        if relay.strip_carriage_returns {
            filters.push(StripCarriageReturns);
        }

        let sockets = Arc::new(SessionSockets::default());
        sockets.track(SockRef::from(&client));

        Self {
            id,
            client,
            client_addr,
            endpoint,
            client_chunk: relay.client_chunk_size.max(1),
            endpoint_chunk: relay.endpoint_chunk_size.max(1),
            connect_timeout: relay.connect_timeout(),
            filters,
            initial: Vec::new(),
            sockets,
        }
    }

    /// Client bytes already read during the handshake. They go through the
    /// filter chain ahead of anything read later.
    pub fn with_initial_data(mut self, data: Vec<u8>) -> Self {
        self.initial = data;
        self
    }

    /// Append a filter. Filters run in the order they were added.
    pub fn add_filter(&mut self, filter: impl Filter + 'static) {
        self.filters.push(filter);
    }

    pub fn filters_mut(&mut self) -> &mut FilterChain {
        &mut self.filters
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Shared handle to this session's sockets. Closing it ends both
    /// connections from outside the session.
    pub fn sockets(&self) -> Arc<SessionSockets> {
        self.sockets.clone()
    }

    /// Relay until the session ends. Must be polled inside a tokio runtime
    /// with I/O enabled; the filter chain is fixed from here on.
    pub async fn run(self, shutdown: CancellationToken) -> SessionExit {
        let Session {
            id,
            client,
            client_addr,
            endpoint,
            client_chunk,
            endpoint_chunk,
            connect_timeout,
            filters,
            initial,
            sockets,
        } = self;

        let mut client = match TcpStream::from_std(client) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(session = id, error = %e, "could not adopt client socket");
                return SessionExit::ClientError(e.kind());
            }
        };

        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                close(&client);
                sockets.close_all();
                return SessionExit::Terminated;
            }
            r = connect(&endpoint, connect_timeout) => r,
        };

        let mut upstream = match connected {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session = id, %endpoint, error = %e, "unable to connect to endpoint");
                let _ = tokio::time::timeout(FLUSH_TIMEOUT, client.write_all(ENDPOINT_ERROR_LINE)).await;
                close(&client);
                sockets.close_all();
                return SessionExit::Unreachable;
            }
        };
        sockets.track(SockRef::from(&upstream));

        tracing::info!(session = id, client = %client_addr, %endpoint, "relay started");

        let relay = Relay {
            id,
            client_chunk,
            endpoint_chunk,
            filters,
        };
        let exit = relay
            .pump(&mut client, &mut upstream, initial, &shutdown)
            .await;

        close(&client);
        close(&upstream);
        sockets.close_all();

        match &exit {
            SessionExit::ClientError(_) | SessionExit::EndpointError(_) => {
                tracing::info!(session = id, client = %client_addr, %endpoint, exit = ?exit, "relay failed")
            }
            _ => tracing::info!(session = id, client = %client_addr, %endpoint, exit = ?exit, "relay ended"),
        }
        exit
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("endpoint", &self.endpoint)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

struct Relay {
    id: ConnId,
    client_chunk: usize,
    endpoint_chunk: usize,
    filters: FilterChain,
}

impl Relay {
    async fn pump(
        &self,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
        initial: Vec<u8>,
        shutdown: &CancellationToken,
    ) -> SessionExit {
        let (mut client_rd, mut client_wr) = client.split();
        let (mut upstream_rd, mut upstream_wr) = upstream.split();

        let mut to_endpoint = BytesMut::new();
        let mut to_client = BytesMut::new();
        let mut client_buf = vec![0u8; self.client_chunk];
        let mut endpoint_buf = vec![0u8; self.endpoint_chunk];

        if !initial.is_empty() {
            if let Err(stopped) = self.filter_into(&initial, &mut to_endpoint) {
                return SessionExit::Filtered(stopped.filter);
            }
        }

        loop {
            let endpoint_n = to_endpoint.len().min(self.endpoint_chunk);
            let client_n = to_client.len().min(self.client_chunk);

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionExit::Terminated,

                r = upstream_wr.write(&to_endpoint[..endpoint_n]), if endpoint_n > 0 => match r {
                    Ok(n) => to_endpoint.advance(n),
                    Err(e) => return SessionExit::EndpointError(e.kind()),
                },

                r = client_wr.write(&to_client[..client_n]), if client_n > 0 => match r {
                    Ok(n) => to_client.advance(n),
                    Err(e) => return SessionExit::ClientError(e.kind()),
                },

                r = client_rd.read(&mut client_buf) => match r {
                    Ok(0) => {
                        flush(&mut upstream_wr, &to_endpoint).await;
                        return SessionExit::ClientClosed;
                    }
                    Ok(n) => {
                        if let Err(stopped) = self.filter_into(&client_buf[..n], &mut to_endpoint) {
                            flush(&mut upstream_wr, &to_endpoint).await;
                            return SessionExit::Filtered(stopped.filter);
                        }
                    }
                    Err(e) => return SessionExit::ClientError(e.kind()),
                },

                r = upstream_rd.read(&mut endpoint_buf) => match r {
                    Ok(0) => {
                        flush(&mut client_wr, &to_client).await;
                        return SessionExit::EndpointClosed;
                    }
                    Ok(n) => to_client.extend_from_slice(&endpoint_buf[..n]),
                    Err(e) => return SessionExit::EndpointError(e.kind()),
                },
            }
        }
    }

    /// Run the chain over one client chunk and queue the result.
    fn filter_into(&self, chunk: &[u8], out: &mut BytesMut) -> Result<(), Stopped> {
        let output = self.filters.run(chunk)?;
        if let Some(fault) = &output.fault {
            tracing::warn!(session = self.id, filter = %fault.filter, reason = %fault.reason, "filter failed; relaying chunk as transformed so far");
        }
        out.extend_from_slice(&output.data);
        Ok(())
    }
}

async fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let attempt = TcpStream::connect((endpoint.addr.as_str(), endpoint.port));
    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => attempt.await,
    }
}

/// Best-effort write of whatever is still queued for a side that is about to
/// be closed.
async fn flush<W: AsyncWrite + Unpin>(w: &mut W, pending: &[u8]) {
    if pending.is_empty() {
        return;
    }
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, w.write_all(pending)).await;
}

/// Shut a socket down in both directions, ignoring errors.
pub(crate) fn close(stream: &TcpStream) {
    let _ = SockRef::from(stream).shutdown(Shutdown::Both);
}
