//! Connection reactor: accepts mTLS connections and serves framed requests.
//!
//! Sockets are non-blocking and multiplexed by the tokio event loop on a
//! small fixed set of worker threads configured at runtime construction;
//! each connection is a lightweight task, never a dedicated thread.
//!
//! Per-connection lifecycle:
//! - `Unauthenticated`: TCP accepted, nothing exchanged yet
//! - `Handshaking`: rustls is driven on every readiness event until it
//!   completes or fails; bounded by the handshake timeout
//! - `Established`: client certificate verified, request frames served in
//!   order, each answered before the next is read
//! - `Closed`: handshake failure, protocol error, idle timeout, peer EOF
//!   or shutdown
//!
//! Handlers must not block: disk and signing work goes through the
//! [`WorkerPool`](super::pool::WorkerPool).

use crate::core::config::{HANDSHAKE_TIMEOUT, IDLE_TIMEOUT};
use crate::core::error::TransferError;
use crate::core::protocol::codec::{read_frame, write_frame};
use crate::core::protocol::message::{Request, Response};
use crate::utils::sos::SignalOfStop;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unauthenticated,
    Handshaking,
    Established,
    Closed,
}

/// What a handler knows about the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ConnCtx {
    pub id: u64,
    pub remote: SocketAddr,
}

/// A response plus an optional admission permit. The permit is released
/// only after the response has been written, so a capacity slot covers the
/// whole transfer of a chunk.
pub struct Reply {
    pub response: Response,
    pub hold: Option<OwnedSemaphorePermit>,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self {
            response,
            hold: None,
        }
    }
}

/// Application-level request handling plugged into the reactor.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &ConnCtx, request: Request) -> impl Future<Output = Reply> + Send;
}

/// Reactor timeouts. Independent of the task-level stall timeout.
#[derive(Debug, Clone, Copy)]
pub struct ReactorTimeouts {
    pub handshake: Duration,
    pub idle: Duration,
}

impl Default for ReactorTimeouts {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT,
            idle: IDLE_TIMEOUT,
        }
    }
}

pub struct Reactor<H> {
    name: &'static str,
    acceptor: TlsAcceptor,
    handler: Arc<H>,
    timeouts: ReactorTimeouts,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnState>>,
}

impl<H: RequestHandler> Reactor<H> {
    pub fn new(name: &'static str, tls: Arc<ServerConfig>, handler: Arc<H>) -> Arc<Self> {
        Self::with_timeouts(name, tls, handler, ReactorTimeouts::default())
    }

    pub fn with_timeouts(
        name: &'static str,
        tls: Arc<ServerConfig>,
        handler: Arc<H>,
        timeouts: ReactorTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            acceptor: TlsAcceptor::from(tls),
            handler,
            timeouts,
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Accept connections on `listener` until `sos` fires. Live connections
    /// observe the same signal and close between requests.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, sos: SignalOfStop) {
        info!(
            event = "reactor_listening",
            reactor = self.name,
            addr = ?listener.local_addr().ok(),
            "Listening"
        );
        loop {
            let accepted = tokio::select! {
                _ = sos.wait() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((tcp, remote)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut conns = self.lock_conns();
                        conns.retain(|_, s| *s != ConnState::Closed);
                        conns.insert(id, ConnState::Unauthenticated);
                    }
                    let this = Arc::clone(&self);
                    let sos = sos.clone();
                    tokio::spawn(async move {
                        this.run_connection(id, tcp, remote, sos).await;
                    });
                }
                Err(e) => {
                    warn!(event = "accept_failure", reactor = self.name, error = %e, "Accept failed");
                }
            }
        }
        info!(event = "reactor_stopped", reactor = self.name, "Stopped accepting");
    }

    /// Snapshot of tracked connections and their state.
    pub fn connections(&self) -> Vec<(u64, ConnState)> {
        let conns = self.lock_conns();
        let mut out: Vec<_> = conns.iter().map(|(id, s)| (*id, *s)).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    async fn run_connection(&self, id: u64, tcp: TcpStream, remote: SocketAddr, sos: SignalOfStop) {
        let _ = tcp.set_nodelay(true);
        self.set_state(id, ConnState::Handshaking);

        let mut tls = match timeout(self.timeouts.handshake, self.acceptor.accept(tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = TransferError::from(e);
                warn!(
                    event = "handshake_failure",
                    reactor = self.name,
                    conn = id,
                    %remote,
                    error = %err,
                    "TLS handshake failed"
                );
                self.close(id);
                return;
            }
            Err(_) => {
                warn!(
                    event = "handshake_timeout",
                    reactor = self.name,
                    conn = id,
                    %remote,
                    "TLS handshake timed out"
                );
                self.close(id);
                return;
            }
        };

        self.set_state(id, ConnState::Established);
        debug!(event = "connection_established", reactor = self.name, conn = id, %remote, "Connection established");
        let ctx = ConnCtx { id, remote };

        loop {
            let next = tokio::select! {
                _ = sos.wait() => break,
                res = read_frame::<_, Request>(&mut tls, self.timeouts.idle) => res,
            };
            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    debug!(event = "connection_read_end", reactor = self.name, conn = id, error = %e, "Closing connection");
                    break;
                }
            };

            let kind = request.kind();
            let Reply { response, hold } = self.handler.handle(&ctx, request).await;
            let written = write_frame(&mut tls, &response).await;
            drop(hold);
            if let Err(e) = written {
                warn!(
                    event = "response_write_failure",
                    reactor = self.name,
                    conn = id,
                    request = kind,
                    error = %e,
                    "Failed to send response"
                );
                break;
            }
        }

        let _ = tls.shutdown().await;
        self.close(id);
    }

    fn set_state(&self, id: u64, state: ConnState) {
        self.lock_conns().insert(id, state);
    }

    /// Closed entries stay visible until the next accept prunes them.
    fn close(&self, id: u64) {
        self.set_state(id, ConnState::Closed);
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnState>> {
        match self.conns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
