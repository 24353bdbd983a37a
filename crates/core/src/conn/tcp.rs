//! Cleartext TCP listener.

use std::io::Result as IoResult;
use std::vec;

use async_trait::async_trait;
use tokio::net::{TcpListener as TokioTcpListener, ToSocketAddrs};

use crate::http::Scheme;

use super::{Accepted, Acceptor, Holding, IncomingStream, Listener};

/// A not-yet-bound cleartext listener.
pub struct TcpListener<T> {
    local_addr: T,
}

impl<T: ToSocketAddrs + Send> TcpListener<T> {
    /// Creates a listener for the given address.
    pub fn new(local_addr: T) -> Self {
        Self { local_addr }
    }

    /// Binds now, returning the acceptor.
    pub async fn bind(self) -> IoResult<TcpAcceptor> {
        self.into_acceptor().await
    }
}

#[async_trait]
impl<T: ToSocketAddrs + Send> Listener for TcpListener<T> {
    type Acceptor = TcpAcceptor;

    async fn into_acceptor(self) -> IoResult<Self::Acceptor> {
        let inner = TokioTcpListener::bind(self.local_addr).await?;
        let holding = Holding {
            local_addr: inner.local_addr()?,
            http_scheme: Scheme::HTTP,
        };
        Ok(TcpAcceptor {
            inner,
            holdings: vec![holding],
        })
    }
}

/// A bound cleartext acceptor.
pub struct TcpAcceptor {
    inner: TokioTcpListener,
    holdings: Vec<Holding>,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    async fn accept(&mut self) -> IoResult<Accepted> {
        let (stream, remote_addr) = self.inner.accept().await?;
        Ok(Accepted {
            stream: IncomingStream::Tcp(stream),
            local_addr: self.holdings[0].local_addr,
            remote_addr,
            http_scheme: Scheme::HTTP,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_bind_and_accept() {
        let mut acceptor = TcpListener::new("127.0.0.1:0").bind().await.expect("bind");
        let addr = acceptor.holdings()[0].local_addr;
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            stream.write_all(b"x").await.expect("write");
        });
        let accepted = acceptor.accept().await.expect("accept");
        assert_eq!(accepted.local_addr, addr);
        assert_eq!(accepted.http_scheme, Scheme::HTTP);
    }
}
