//! TCP listener with a re-armed accept deadline.
//!
//! Each [`Listener::accept`] call is bounded by the configured deadline, so
//! the [`serve`] loop wakes up regularly to check its server's shutdown
//! token even when no clients connect.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConnConfig, ListenerConfig};
use crate::error::{is_disconnect_kind, Error, Result};
use crate::tls::TlsConfig;
use crate::transport::BoxStream;

/// Pause after an unexpected accept error, e.g. descriptor exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of a failed accept.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The accept deadline expired. Not a failure.
    #[error("accept deadline expired")]
    Timeout,

    /// The peer went away during accept (reset, EOF, closed).
    #[error("peer disconnected during accept: {0}")]
    Disconnected(io::Error),

    /// Any other accept failure.
    #[error("accept failed: {0}")]
    Io(io::Error),
}

impl From<io::Error> for AcceptError {
    fn from(e: io::Error) -> Self {
        if is_disconnect_kind(e.kind()) {
            Self::Disconnected(e)
        } else {
            Self::Io(e)
        }
    }
}

/// Something the accept loop hands connections to.
pub trait Server: Send + Sync {
    /// Take ownership of an accepted connection. Must not block: long work
    /// belongs in a spawned task.
    fn serve(&self, incoming: Incoming);

    /// Cancelled when the server wants the accept loop to stop.
    fn shutdown_token(&self) -> &CancellationToken;
}

/// A listening socket, optionally terminating TLS.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    accept_deadline: Duration,
    keep_alive: Duration,
    handshake_timeout: Duration,
}

impl Listener {
    /// Bind a plain TCP listener.
    pub async fn bind(addr: &str, config: &ListenerConfig, conn: &ConnConfig) -> Result<Self> {
        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::InvalidAddr(addr.to_string()))?;

        let inner = TcpListener::bind(socket_addr)
            .await
            .map_err(|source| Error::Listen {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            inner,
            tls: None,
            accept_deadline: config.accept_deadline(),
            keep_alive: config.keep_alive(),
            handshake_timeout: conn.handshake_timeout(),
        })
    }

    /// Bind a listener that terminates TLS on every accepted connection.
    pub async fn bind_tls(
        addr: &str,
        config: &ListenerConfig,
        conn: &ConnConfig,
        tls: &TlsConfig,
    ) -> Result<Self> {
        let mut listener = Self::bind(addr, config, conn).await?;
        listener.tls = Some(tls.acceptor());
        Ok(listener)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept one connection, waiting at most the accept deadline.
    ///
    /// Accepted sockets get TCP keep-alive. The TLS handshake, if any, is
    /// deferred to [`Incoming::establish`] so it never stalls this loop.
    pub async fn accept(&self) -> Result<Incoming, AcceptError> {
        let (stream, peer) = tokio::time::timeout(self.accept_deadline, self.inner.accept())
            .await
            .map_err(|_| AcceptError::Timeout)??;

        if let Err(e) = set_keep_alive(&stream, self.keep_alive) {
            debug!(peer = %peer, error = %e, "failed to enable keep-alive");
        }

        Ok(Incoming {
            stream,
            peer,
            tls: self.tls.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

fn set_keep_alive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// An accepted connection that has not finished its handshake yet.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl Incoming {
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Finish the TLS handshake (when configured) and return the stream.
    pub async fn establish(self) -> Result<BoxStream> {
        match self.tls {
            None => Ok(Box::new(self.stream)),
            Some(acceptor) => {
                let stream =
                    tokio::time::timeout(self.handshake_timeout, acceptor.accept(self.stream))
                        .await
                        .map_err(|_| Error::Timeout("TLS handshake"))?
                        .map_err(|e| Error::Tls(format!("handshake with {}: {e}", self.peer)))?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Run the accept loop until the server's shutdown token is cancelled.
///
/// Deadline expiry is the shutdown check; disconnect-class errors are
/// logged and ignored; other accept errors are logged and the loop keeps
/// going.
pub async fn serve<S: Server + ?Sized>(listener: &Listener, server: &S) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, "Listening"),
        Err(e) => warn!(error = %e, "Listening on unknown address"),
    }

    loop {
        if server.shutdown_token().is_cancelled() {
            debug!("Accept loop closing");
            break;
        }

        match listener.accept().await {
            Ok(incoming) => {
                debug!(peer = %incoming.peer_addr(), "Accepted connection");
                server.serve(incoming);
            }
            Err(AcceptError::Timeout) => {}
            Err(AcceptError::Disconnected(e)) => {
                info!(error = %e, "Accept loop disconnected");
            }
            Err(AcceptError::Io(e)) => {
                error!(error = %e, "Unexpected accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Bind `addr` and serve until shutdown.
pub async fn listen_and_serve<S: Server + ?Sized>(
    server: &S,
    addr: &str,
    config: &ListenerConfig,
    conn: &ConnConfig,
) -> Result<()> {
    let listener = Listener::bind(addr, config, conn).await?;
    serve(&listener, server).await;
    Ok(())
}

/// Bind `addr` with TLS termination and serve until shutdown.
pub async fn listen_and_serve_tls<S: Server + ?Sized>(
    server: &S,
    addr: &str,
    config: &ListenerConfig,
    conn: &ConnConfig,
    tls: &TlsConfig,
) -> Result<()> {
    let listener = Listener::bind_tls(addr, config, conn, tls).await?;
    serve(&listener, server).await;
    Ok(())
}
