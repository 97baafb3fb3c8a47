//! Stream listeners and datagram endpoints with close semantics.
//!
//! # Responsibilities
//! - Accept connections on TCP or unix-domain sockets
//! - Terminate TLS without blocking the accept loop
//! - Receive and send datagrams on UDP sockets
//! - Fail every pending and future accept/receive once closed
//!
//! # Design Decisions
//! - Closing is a signal, not a drop: the handler owns the socket and releases
//!   it when it returns
//! - TLS handshakes run concurrently inside the listener and are bounded by
//!   [`TLS_HANDSHAKE_TIMEOUT`]; failed handshakes are logged and skipped

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Upper bound on a single TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker carried by the I/O error returned from a closed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("use of closed network listener")]
pub struct ListenerClosed;

/// Whether `err` was produced by accepting or receiving on a closed listener.
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<ListenerClosed>())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ListenerClosed)
}

/// Address of a socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Unix-domain address; `None` for unnamed sockets.
    Unix(Option<PathBuf>),
}

/// Local addresses share the peer address representation.
pub type LocalAddr = PeerAddr;

impl PeerAddr {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Inet(addr) => Some(*addr),
            PeerAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Inet(addr)
    }
}

#[cfg(unix)]
impl From<tokio::net::unix::SocketAddr> for PeerAddr {
    fn from(addr: tokio::net::unix::SocketAddr) -> Self {
        PeerAddr::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

/// Handle that closes a listener or endpoint from another task.
#[derive(Debug, Clone)]
pub struct ListenerCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl ListenerCloser {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the listener. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move { wait_closed(&mut rx).await }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// PROXY-protocol settings attached to a listener.
///
/// Header parsing is left to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyProtocol {
    pub read_header_timeout: Option<Duration>,
}

/// An accepted stream.
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    /// TLS session over a plain connection.
    Tls(Box<TlsStream<Connection>>),
}

impl Connection {
    pub fn peer_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Connection::Tcp(s) => s.peer_addr().map(PeerAddr::from),
            #[cfg(unix)]
            Connection::Unix(s) => s.peer_addr().map(PeerAddr::from),
            Connection::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Connection::Tls(_))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Connection::Tcp(_) => "Tcp",
            #[cfg(unix)]
            Connection::Unix(_) => "Unix",
            Connection::Tls(_) => "Tls",
        };
        f.debug_tuple("Connection").field(&kind).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Connection::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Connection::Unix(s) => s.is_write_vectored(),
            Connection::Tls(s) => s.is_write_vectored(),
        }
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Bound {
    async fn accept(&self) -> io::Result<(Connection, PeerAddr)> {
        match self {
            Bound::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Connection::Tcp(stream), peer.into()))
            }
            #[cfg(unix)]
            Bound::Unix(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Connection::Unix(stream), peer.into()))
            }
        }
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Bound::Tcp(l) => l.local_addr().map(PeerAddr::from),
            #[cfg(unix)]
            Bound::Unix(l) => l.local_addr().map(PeerAddr::from),
        }
    }
}

type Handshake = BoxFuture<'static, Option<(Connection, PeerAddr)>>;

/// Connection-oriented listener over TCP or a unix-domain stream socket,
/// optionally terminating TLS.
pub struct StreamListener {
    bound: Bound,
    tls: Option<TlsAcceptor>,
    handshakes: FuturesUnordered<Handshake>,
    closer: ListenerCloser,
    closed_rx: watch::Receiver<bool>,
    socket_path: Option<PathBuf>,
    proxy_protocol: Option<ProxyProtocol>,
}

impl StreamListener {
    fn new(bound: Bound) -> Self {
        let closer = ListenerCloser::new();
        Self {
            bound,
            tls: None,
            handshakes: FuturesUnordered::new(),
            closed_rx: closer.subscribe(),
            closer,
            socket_path: None,
            proxy_protocol: None,
        }
    }

    /// Adopt a pre-opened TCP listener.
    pub fn from_tcp(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(listener)?.into())
    }

    /// Adopt a pre-opened unix-domain listener. The socket file stays
    /// owned by the caller.
    #[cfg(unix)]
    pub fn from_unix(listener: std::os::unix::net::UnixListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(UnixListener::from_std(listener)?.into())
    }

    /// Accept the next connection, completing the TLS handshake if the
    /// listener terminates TLS.
    pub async fn accept(&mut self) -> io::Result<(Connection, PeerAddr)> {
        loop {
            if self.closer.is_closed() {
                return Err(closed_error());
            }
            tokio::select! {
                biased;
                _ = wait_closed(&mut self.closed_rx) => return Err(closed_error()),
                Some(done) = self.handshakes.next(), if !self.handshakes.is_empty() => {
                    if let Some(accepted) = done {
                        return Ok(accepted);
                    }
                }
                accepted = self.bound.accept() => {
                    let (conn, peer) = accepted?;
                    tracing::debug!(peer_addr = %peer, "Connection accepted");
                    match &self.tls {
                        None => return Ok((conn, peer)),
                        Some(acceptor) => {
                            self.handshakes.push(Box::pin(handshake(acceptor.clone(), conn, peer)));
                        }
                    }
                }
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        self.bound.local_addr()
    }

    pub fn closer(&self) -> ListenerCloser {
        self.closer.clone()
    }

    /// Close the listener; pending and future accepts fail with [`ListenerClosed`].
    pub fn close(&self) {
        self.closer.close();
    }

    /// Resolves once the listener is closed.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.closer.closed()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Socket file created for this listener, removed when the server stops.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn proxy_protocol(&self) -> Option<ProxyProtocol> {
        self.proxy_protocol
    }

    pub fn with_proxy_protocol(mut self, settings: ProxyProtocol) -> Self {
        self.proxy_protocol = Some(settings);
        self
    }

    pub(crate) fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub(crate) fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }
}

async fn handshake(
    acceptor: TlsAcceptor,
    conn: Connection,
    peer: PeerAddr,
) -> Option<(Connection, PeerAddr)> {
    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(conn)).await {
        Ok(Ok(stream)) => Some((Connection::Tls(Box::new(stream)), peer)),
        Ok(Err(e)) => {
            tracing::warn!(peer_addr = %peer, error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            tracing::warn!(peer_addr = %peer, timeout = ?TLS_HANDSHAKE_TIMEOUT, "TLS handshake timed out");
            None
        }
    }
}

impl From<TcpListener> for StreamListener {
    fn from(listener: TcpListener) -> Self {
        StreamListener::new(Bound::Tcp(listener))
    }
}

#[cfg(unix)]
impl From<UnixListener> for StreamListener {
    fn from(listener: UnixListener) -> Self {
        StreamListener::new(Bound::Unix(listener))
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamListener")
            .field("local_addr", &self.local_addr().ok())
            .field("tls", &self.is_tls())
            .field("closed", &self.closer.is_closed())
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl axum::serve::Listener for StreamListener {
    type Io = Connection;
    type Addr = PeerAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match StreamListener::accept(self).await {
                Ok(accepted) => return accepted,
                // axum has no way to end an accept loop; it stops polling
                // once its graceful-shutdown signal fires.
                Err(e) if is_listener_closed(&e) => std::future::pending::<()>().await,
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        StreamListener::local_addr(self)
    }
}

/// Connectionless endpoint over a UDP socket.
///
/// Receiving and sending take `&self`, so the endpoint can be shared
/// through an `Arc` between tasks.
#[derive(Debug)]
pub struct DatagramEndpoint {
    socket: UdpSocket,
    closer: ListenerCloser,
}

impl DatagramEndpoint {
    /// Adopt a pre-opened UDP socket.
    pub fn from_udp(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket)?.into())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.closer.is_closed() {
            return Err(closed_error());
        }
        let mut closed_rx = self.closer.subscribe();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed_rx) => Err(closed_error()),
            received = self.socket.recv_from(buf) => received,
        }
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closer.is_closed() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, target).await
    }

    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        self.socket.local_addr().map(PeerAddr::from)
    }

    pub fn closer(&self) -> ListenerCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.closer.closed()
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl From<UdpSocket> for DatagramEndpoint {
    fn from(socket: UdpSocket) -> Self {
        Self {
            socket,
            closer: ListenerCloser::new(),
        }
    }
}

/// Result of the listener factory.
#[derive(Debug)]
pub enum Listener {
    Stream(StreamListener),
    Datagram(DatagramEndpoint),
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Listener::Stream(l) => l.local_addr(),
            Listener::Datagram(d) => d.local_addr(),
        }
    }

    pub fn closer(&self) -> ListenerCloser {
        match self {
            Listener::Stream(l) => l.closer(),
            Listener::Datagram(d) => d.closer(),
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Stream(l) => l.socket_path(),
            Listener::Datagram(_) => None,
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Listener::Datagram(_))
    }

    /// The stream listener, or `InvalidInput` for a datagram endpoint.
    pub fn into_stream(self) -> io::Result<StreamListener> {
        match self {
            Listener::Stream(l) => Ok(l),
            Listener::Datagram(d) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "datagram endpoint {} cannot be used as a stream listener",
                    d.local_addr().map(|a| a.to_string()).unwrap_or_default()
                ),
            )),
        }
    }

    pub fn into_datagram(self) -> io::Result<DatagramEndpoint> {
        match self {
            Listener::Datagram(d) => Ok(d),
            Listener::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream listener cannot be used as a datagram endpoint",
            )),
        }
    }
}

impl From<StreamListener> for Listener {
    fn from(listener: StreamListener) -> Self {
        Listener::Stream(listener)
    }
}

impl From<DatagramEndpoint> for Listener {
    fn from(endpoint: DatagramEndpoint) -> Self {
        Listener::Datagram(endpoint)
    }
}
