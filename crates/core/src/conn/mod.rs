//! Listener and acceptor traits plus their implementations.

use std::fmt::{self, Display, Formatter};
use std::io::Result as IoResult;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::http::Scheme;

cfg_feature! {
    #![feature = "rustls"]
    pub mod rustls;
    pub use rustls::{Keycert, RustlsConfig, RustlsListener};
}

mod tcp;
pub use tcp::{TcpAcceptor, TcpListener};

/// An accepted connection before protocol dispatch.
///
/// TLS handshakes are not driven on the accept loop; the per-connection task
/// finishes them so one slow peer cannot stall accepting.
pub struct Accepted {
    pub(crate) stream: IncomingStream,
    /// Local listener address.
    pub local_addr: SocketAddr,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// `http` or `https`.
    pub http_scheme: Scheme,
}

pub(crate) enum IncomingStream {
    Tcp(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<tokio_rustls::Accept<TcpStream>>),
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("http_scheme", &self.http_scheme.as_str())
            .finish_non_exhaustive()
    }
}

/// What a bound listener is serving.
#[derive(Clone, Debug)]
pub struct Holding {
    /// Local address.
    pub local_addr: SocketAddr,
    /// Http scheme.
    pub http_scheme: Scheme,
}

impl Display for Holding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.http_scheme, self.local_addr)
    }
}

/// Acceptor trait.
#[async_trait]
pub trait Acceptor: Send {
    /// Returns the holding information this acceptor is bound to.
    fn holdings(&self) -> &[Holding];

    /// Accepts a new incoming connection.
    async fn accept(&mut self) -> IoResult<Accepted>;
}

/// Listener trait.
#[async_trait]
pub trait Listener: Send {
    /// Acceptor type.
    type Acceptor: Acceptor;

    /// Bind and convert into an acceptor.
    async fn into_acceptor(self) -> IoResult<Self::Acceptor>;
}
