use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use http::Extensions;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the first byte of a request head
    AwaitHeaders,
    /// A request is being routed, read, or answered
    Exchange,
    /// A response was sent, waiting for the next request
    KeepAliveIdle,
    /// Switched to a raw tunnel after a protocol upgrade
    Upgraded,
    /// Closing or closed, nothing more is read or written
    Closed,
}

/// A transport connection as seen by filters and handlers.
///
/// The extensions are the connection's context bag: a filter shared by many
/// connections keeps its per-connection state there.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    tls: bool,
    state: ConnectionState,
    token: CancellationToken,
    extensions: Extensions,
}

impl Connection {
    pub fn new(local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>, tls: bool) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
            tls,
            state: ConnectionState::AwaitHeaders,
            token: CancellationToken::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != ConnectionState::Closed {
            self.state = state;
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Asks for the connection to be closed. Idempotent.
    pub fn close(&mut self) {
        if !self.token.is_cancelled() {
            debug!(conn_id = self.id, "connection close requested");
            self.token.cancel();
        }
        self.state = ConnectionState::Closed;
    }

    pub fn is_closing(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A handle that can close this connection from elsewhere, e.g. a spawned task.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle { id: self.id, token: self.token.clone() }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A detached reference to a [`Connection`].
///
/// Closing through the handle aborts the connection at its next suspension
/// point. Once the connection is torn down the handle is inert.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}
