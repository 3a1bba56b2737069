use crate::socket::endpoint::HostPortPair;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Instant;
use futures::task::noop_waker_ref;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected transport stream (TCP or SSL).
#[derive(Debug)]
pub enum SocketType {
    Tcp(tokio::net::TcpStream),
    Ssl(tokio_boring::SslStream<tokio::net::TcpStream>),
}

impl SocketType {
    /// Lightweight liveness test: peer address plus a non-blocking peek.
    /// Catches RST and FIN; pending bytes stay in the socket.
    fn check_tcp_connected(stream: &tokio::net::TcpStream) -> bool {
        if stream.peer_addr().is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        let mut peeked = ReadBuf::new(&mut buf);
        let mut cx = Context::from_waker(noop_waker_ref());
        match stream.poll_peek(&mut cx, &mut peeked) {
            Poll::Ready(Ok(0)) => false,
            Poll::Ready(Ok(_)) => true,
            Poll::Ready(Err(ref e)) if e.kind() == ErrorKind::WouldBlock => true,
            Poll::Ready(Err(_)) => false,
            Poll::Pending => true,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            SocketType::Tcp(s) => Self::check_tcp_connected(s),
            SocketType::Ssl(s) => Self::check_tcp_connected(s.get_ref()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketType::Tcp(s) => s.local_addr().ok(),
            SocketType::Ssl(s) => s.get_ref().local_addr().ok(),
        }
    }
}

impl AsyncRead for SocketType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            SocketType::Ssl(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketType {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            SocketType::Ssl(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
            SocketType::Ssl(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            SocketType::Ssl(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    peer: HostPortPair,
    local: Option<SocketAddr>,
    established_at: Instant,
    closed: AtomicBool,
    socket: Mutex<Option<SocketType>>,
}

/// Opaque handle to an established connection.
///
/// Clones share one underlying connection; identity is the [`ConnectionId`].
/// While the request that leased it is running, the holder may
/// [`take_socket`](Connection::take_socket) to do I/O and hand it back with
/// [`restore_socket`](Connection::restore_socket) before returning the
/// connection to the pool.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(peer: HostPortPair, socket: SocketType) -> Self {
        let local = socket.local_addr();
        Self::build(peer, local, Some(socket))
    }

    /// A connection with no socket attached, for transports that manage I/O
    /// elsewhere.
    pub fn detached(peer: HostPortPair, local: Option<SocketAddr>) -> Self {
        Self::build(peer, local, None)
    }

    fn build(peer: HostPortPair, local: Option<SocketAddr>, socket: Option<SocketType>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                peer,
                local,
                established_at: Instant::now(),
                closed: AtomicBool::new(false),
                socket: Mutex::new(socket),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The host/port this connection was opened to (the proxy when tunnelled).
    pub fn peer(&self) -> &HostPortPair {
        &self.inner.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    pub fn established_at(&self) -> Instant {
        self.inner.established_at
    }

    fn socket(&self) -> MutexGuard<'_, Option<SocketType>> {
        self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the socket out for I/O. Returns `None` if another holder has it.
    pub fn take_socket(&self) -> Option<SocketType> {
        self.socket().take()
    }

    pub fn restore_socket(&self, socket: SocketType) {
        *self.socket() = Some(socket);
    }

    /// False once closed or once the attached socket reports the peer gone.
    pub fn is_connected(&self) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.socket().as_ref().map_or(true, SocketType::is_connected)
    }

    /// Drop the socket and mark the connection dead.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.socket().take();
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }
}

/// Non-owning handle for side tables keyed by [`ConnectionId`].
#[derive(Clone)]
pub struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }

    /// True while some [`Connection`] handle still exists.
    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakConnection").field(&self.is_live()).finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}
