//! mTLS listener for `axum::serve`.
//!
//! The accept loop only accepts TCP connections; every TLS handshake runs in
//! its own task under `handshake_timeout`, so a slow or silent client cannot
//! stall other connections. Finished handshakes are handed to axum through a
//! channel.
//!
//! The server config sits behind an [`ArcSwap`]: each handshake loads the
//! current snapshot, so a rotated certificate applies to new connections
//! while established ones keep the config they were accepted with.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::serve::{IncomingStream, Listener};
use axum::extract::connect_info::Connected;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, trace};

use crate::trust::PeerIdentity;

/// Finished handshakes waiting for axum to pick them up
const ACCEPT_BACKLOG: usize = 256;

/// Server TLS config that can be replaced while the listener runs
#[derive(Clone)]
pub struct ReloadableAcceptor {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl ReloadableAcceptor {
    /// Wrap the initial config
    #[must_use]
    pub fn new(initial: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Config the next handshake will use
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// Swap in a new config for subsequent handshakes
    pub fn replace(&self, next: ServerConfig) {
        self.inner.store(Arc::new(next));
    }

    /// Run a server handshake with the current config
    ///
    /// # Errors
    ///
    /// Returns the IO error rustls reports for a failed handshake.
    pub async fn accept(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        TlsAcceptor::from(self.inner.load_full()).accept(stream).await
    }
}

impl std::fmt::Debug for ReloadableAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadableAcceptor").finish_non_exhaustive()
    }
}

/// TCP listener that yields established mTLS streams
#[derive(Debug)]
pub struct MtlsListener {
    pub(crate) local_addr: SocketAddr,
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl MtlsListener {
    /// Start accepting on an already bound TCP listener
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn new(
        tcp: TcpListener,
        acceptor: ReloadableAcceptor,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let local_addr = tcp.local_addr()?;
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(tcp, acceptor, handshake_timeout, tx));
        Ok(Self {
            local_addr,
            incoming,
            accept_task,
        })
    }

    /// Bind `addr` and start accepting
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        acceptor: ReloadableAcceptor,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        Self::new(TcpListener::bind(addr).await?, acceptor, handshake_timeout)
    }
}

impl Drop for MtlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Listener for MtlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The accept task only ends when the listener is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: ReloadableAcceptor,
    handshake_timeout: Duration,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, remote) = match tcp.accept().await {
            Ok(conn) => conn,
            Err(e) if is_connection_error(&e) => continue,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                error!(error = %e, "TCP accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    trace!(peer = %remote, "TLS handshake complete");
                    let _ = tx.send((tls, remote)).await;
                }
                Ok(Err(e)) => debug!(peer = %remote, error = %e, "TLS handshake failed"),
                Err(_) => debug!(
                    peer = %remote,
                    timeout_ms = u64::try_from(handshake_timeout.as_millis()).unwrap_or(u64::MAX),
                    "TLS handshake timed out"
                ),
            }
        });
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Per-connection info handed to handlers through `ConnectInfo`
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Identity from the verified client certificate, if one was presented
    pub peer: Option<Arc<PeerIdentity>>,
}

impl Connected<IncomingStream<'_, MtlsListener>> for ClientConnection {
    fn connect_info(stream: IncomingStream<'_, MtlsListener>) -> Self {
        let (_, session) = stream.io().get_ref();
        let peer = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| match PeerIdentity::from_der(leaf) {
                Ok(identity) => Some(Arc::new(identity)),
                Err(e) => {
                    debug!(error = %e, "Ignoring unparseable client certificate");
                    None
                }
            });
        Self {
            remote_addr: *stream.remote_addr(),
            peer,
        }
    }
}
