//! Transport substrate
//!
//! Anything that yields an ordered, reliable, bidirectional byte stream can
//! carry Hubwire traffic. TCP is always available; Unix domain sockets are
//! available on unix targets.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A byte stream usable as a connection
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Which kind of stream to listen on or connect with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    #[cfg(unix)]
    Unix,
}

impl FromStr for TransportKind {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            #[cfg(unix)]
            "unix" => Ok(TransportKind::Unix),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported transport: {}", other),
            )),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            #[cfg(unix)]
            TransportKind::Unix => write!(f, "unix"),
        }
    }
}

/// Address of a stream endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    /// Unix socket path (empty for unnamed client sockets)
    Unix(String),
}

impl PeerAddr {
    /// The TCP socket address, if this is a TCP endpoint
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Tcp(addr) => Some(*addr),
            PeerAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(path) if path.is_empty() => write!(f, "unix:(unnamed)"),
            PeerAddr::Unix(path) => write!(f, "unix:{}", path),
        }
    }
}

/// A bound source of incoming streams
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next incoming stream
    async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)>;

    /// The address this listener is bound to
    fn local_addr(&self) -> io::Result<PeerAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        // Only the accept itself may fail the listener.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok((Box::new(stream), PeerAddr::Tcp(addr)))
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        TcpListener::local_addr(self).map(PeerAddr::Tcp)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixListener;

    /// Unix listener that removes its socket file when dropped
    pub struct UnixSocketListener {
        pub(super) listener: UnixListener,
        pub(super) path: PathBuf,
    }

    #[async_trait]
    impl Listener for UnixSocketListener {
        async fn accept(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
            let (stream, addr) = self.listener.accept().await?;
            let peer = addr
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            Ok((Box::new(stream), PeerAddr::Unix(peer)))
        }

        fn local_addr(&self) -> io::Result<PeerAddr> {
            Ok(PeerAddr::Unix(self.path.display().to_string()))
        }
    }

    impl Drop for UnixSocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Bind a listener of the given kind
///
/// For TCP the address is `host:port`; for Unix sockets it is a filesystem path.
pub async fn bind(kind: TransportKind, address: &str) -> io::Result<Box<dyn Listener>> {
    match kind {
        TransportKind::Tcp => {
            let listener = TcpListener::bind(address).await?;
            Ok(Box::new(listener))
        }
        #[cfg(unix)]
        TransportKind::Unix => {
            let path = std::path::PathBuf::from(address);
            let listener = tokio::net::UnixListener::bind(&path)?;
            Ok(Box::new(unix::UnixSocketListener { listener, path }))
        }
    }
}

/// Open a stream of the given kind to `address`
pub async fn connect(kind: TransportKind, address: &str) -> io::Result<(BoxedStream, PeerAddr)> {
    match kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let peer = stream.peer_addr()?;
            Ok((Box::new(stream), PeerAddr::Tcp(peer)))
        }
        #[cfg(unix)]
        TransportKind::Unix => {
            let stream = tokio::net::UnixStream::connect(address).await?;
            Ok((Box::new(stream), PeerAddr::Unix(address.to_string())))
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
