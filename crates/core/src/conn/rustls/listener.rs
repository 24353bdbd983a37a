//! TLS listener wrapping an inner TCP listener.

use std::io::{Error as IoError, Result as IoResult};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::ToSocketAddrs;
use tokio_rustls::TlsAcceptor;

use crate::conn::tcp::{TcpAcceptor, TcpListener};
use crate::conn::{Accepted, Acceptor, Holding, IncomingStream, Listener};
use crate::http::Scheme;

use super::RustlsConfig;

/// A not-yet-bound TLS listener.
pub struct RustlsListener<T> {
    config: RustlsConfig,
    inner: TcpListener<T>,
}

impl<T: ToSocketAddrs + Send> RustlsListener<T> {
    /// Creates a TLS listener for the given address.
    pub fn new(config: RustlsConfig, local_addr: T) -> Self {
        Self {
            config,
            inner: TcpListener::new(local_addr),
        }
    }

    /// Binds now, returning the acceptor.
    pub async fn bind(self) -> IoResult<RustlsAcceptor> {
        self.into_acceptor().await
    }
}

#[async_trait]
impl<T: ToSocketAddrs + Send> Listener for RustlsListener<T> {
    type Acceptor = RustlsAcceptor;

    async fn into_acceptor(self) -> IoResult<Self::Acceptor> {
        let server_config = self.config.build_server_config()?;
        let inner = self.inner.into_acceptor().await?;
        let holdings = inner
            .holdings()
            .iter()
            .map(|h| Holding {
                local_addr: h.local_addr,
                http_scheme: Scheme::HTTPS,
            })
            .collect();
        Ok(RustlsAcceptor {
            tls: TlsAcceptor::from(Arc::new(server_config)),
            inner,
            holdings,
        })
    }
}

/// A bound TLS acceptor. The handshake itself is left to the connection
/// task.
pub struct RustlsAcceptor {
    tls: TlsAcceptor,
    inner: TcpAcceptor,
    holdings: Vec<Holding>,
}

#[async_trait]
impl Acceptor for RustlsAcceptor {
    fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    async fn accept(&mut self) -> IoResult<Accepted> {
        let accepted = self.inner.accept().await?;
        let IncomingStream::Tcp(stream) = accepted.stream else {
            return Err(IoError::other("inner acceptor produced a non-tcp stream"));
        };
        Ok(Accepted {
            stream: IncomingStream::Tls(Box::new(self.tls.accept(stream))),
            local_addr: accepted.local_addr,
            remote_addr: accepted.remote_addr,
            http_scheme: Scheme::HTTPS,
        })
    }
}
