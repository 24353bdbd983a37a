//! Server module: listeners, accept loops, shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::conf::ServerConfig;
use crate::conn::{Accepted, Acceptor, Holding, IncomingStream, Listener, TcpListener};
use crate::http::{Scheme, Version};
use crate::proto::ConnCtx;
use crate::service::HandlerChain;
use crate::stats::{ConnectionMonitor, ConnectionRegistry, ConnectionView, ServerStats, StatsSnapshot};
use crate::{Error, Result};

struct ServerShared {
    conf: Arc<ServerConfig>,
    chain: Arc<HandlerChain>,
    stats: Arc<ServerStats>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<BufferPool>,
    graceful: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
    app_gate: Option<Arc<Semaphore>>,
}

/// An embeddable HTTP server.
///
/// ```no_run
/// use rampart_core::conf::ServerConfig;
/// use rampart_core::service::HandlerChain;
/// use rampart_core::Server;
///
/// # async fn example() -> rampart_core::Result<()> {
/// let server = Server::new(ServerConfig::new().http_port(8080), HandlerChain::new());
/// server.serve().await
/// # }
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    bound: Arc<Mutex<Vec<Holding>>>,
    #[cfg(feature = "rustls")]
    tls: Option<crate::conn::RustlsConfig>,
}

impl Server {
    /// Creates a server from a config and a handler chain.
    #[must_use]
    pub fn new(conf: ServerConfig, chain: HandlerChain) -> Self {
        let app_gate = conf
            .handler_executor_limit
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            shared: Arc::new(ServerShared {
                conf: conf.into_shared(),
                chain: Arc::new(chain),
                stats: Arc::new(ServerStats::default()),
                registry: Arc::new(ConnectionRegistry::default()),
                pool: BufferPool::new(DEFAULT_BUFFER_SIZE, 64),
                graceful: CancellationToken::new(),
                force: CancellationToken::new(),
                tracker: TaskTracker::new(),
                app_gate,
            }),
            bound: Arc::new(Mutex::new(Vec::new())),
            #[cfg(feature = "rustls")]
            tls: None,
        }
    }

    cfg_feature! {
        #![feature = "rustls"]
        /// Installs the TLS configuration used by the HTTPS listener.
        #[must_use]
        pub fn tls(mut self, config: crate::conn::RustlsConfig) -> Self {
            self.tls = Some(config);
            self
        }
    }

    /// Returns a handle for shutdown and observation, valid before and after
    /// [`serve`](Self::serve) is started.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            graceful: self.shared.graceful.clone(),
            force: self.shared.force.clone(),
            tracker: self.shared.tracker.clone(),
            stats: Arc::clone(&self.shared.stats),
            registry: Arc::clone(&self.shared.registry),
            bound: Arc::clone(&self.bound),
        }
    }

    /// A snapshot of the server-wide counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Snapshot views of all open connections.
    #[must_use]
    pub fn active_connections(&self) -> Vec<ConnectionView> {
        self.shared.registry.views()
    }

    fn port_of(port: i32) -> Result<Option<u16>> {
        if port < 0 {
            return Ok(None);
        }
        u16::try_from(port)
            .map(Some)
            .map_err(|_| Error::other(format!("invalid port: {port}")))
    }

    /// Binds the configured listeners and serves until stopped.
    pub async fn serve(self) -> Result<()> {
        let mut accept_tasks = Vec::new();
        if let Some(port) = Self::port_of(self.shared.conf.http_port)? {
            let acceptor = TcpListener::new(SocketAddr::from(([0, 0, 0, 0], port)))
                .into_acceptor()
                .await
                .map_err(Error::Io)?;
            self.bound.lock().extend(acceptor.holdings().iter().cloned());
            accept_tasks.push(tokio::spawn(accept_loop(
                Box::new(acceptor),
                Arc::clone(&self.shared),
            )));
        }
        #[cfg(feature = "rustls")]
        if let Some(port) = Self::port_of(self.shared.conf.https_port)? {
            let tls = self
                .tls
                .clone()
                .ok_or_else(|| Error::other("https port configured without a tls config"))?;
            let acceptor =
                crate::conn::RustlsListener::new(tls, SocketAddr::from(([0, 0, 0, 0], port)))
                    .into_acceptor()
                    .await
                    .map_err(Error::Io)?;
            self.bound.lock().extend(acceptor.holdings().iter().cloned());
            accept_tasks.push(tokio::spawn(accept_loop(
                Box::new(acceptor),
                Arc::clone(&self.shared),
            )));
        }
        #[cfg(not(feature = "rustls"))]
        if Self::port_of(self.shared.conf.https_port)?.is_some() {
            return Err(Error::other("https port configured without tls support"));
        }
        if accept_tasks.is_empty() {
            return Err(Error::other("no listeners configured"));
        }
        for holding in self.bound.lock().iter() {
            tracing::info!(%holding, "listening");
        }

        tokio::select! {
            () = self.shared.graceful.cancelled() => {}
            () = self.shared.force.cancelled() => {}
        }
        for task in accept_tasks {
            let _ = task.await;
        }
        self.shared.tracker.close();
        tokio::select! {
            () = self.shared.tracker.wait() => {}
            () = self.shared.force.cancelled() => {
                let _ =
                    tokio::time::timeout(Duration::from_secs(5), self.shared.tracker.wait()).await;
            }
        }
        Ok(())
    }

    /// Builds a dedicated multi-thread runtime with `nio_threads` workers and
    /// serves on it, blocking the calling thread.
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.shared.conf.nio_threads)
            .enable_all()
            .build()
            .map_err(Error::Io)?;
        runtime.block_on(self.serve())
    }
}

/// Cloneable control handle for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    graceful: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ServerStats>,
    registry: Arc<ConnectionRegistry>,
    bound: Arc<Mutex<Vec<Holding>>>,
}

impl ServerHandle {
    /// Gracefully stops the server: stop accepting, let in-flight exchanges
    /// finish for up to `grace`, then force-close whatever remains.
    pub async fn stop(&self, grace: Duration) {
        self.graceful.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            self.force.cancel();
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.tracker.wait()).await;
    }

    /// Forcibly stops the server, closing all sockets immediately.
    pub fn kill(&self) {
        self.graceful.cancel();
        self.force.cancel();
        self.tracker.close();
    }

    /// A snapshot of the server-wide counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot views of all open connections.
    #[must_use]
    pub fn active_connections(&self) -> Vec<ConnectionView> {
        self.registry.views()
    }

    /// Addresses the server is listening on, once bound.
    #[must_use]
    pub fn holdings(&self) -> Vec<Holding> {
        self.bound.lock().clone()
    }

    /// The bound cleartext address, if an HTTP listener exists.
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.bound
            .lock()
            .iter()
            .find(|h| h.http_scheme == Scheme::HTTP)
            .map(|h| h.local_addr)
    }

    /// The bound TLS address, if an HTTPS listener exists.
    #[must_use]
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.bound
            .lock()
            .iter()
            .find(|h| h.http_scheme == Scheme::HTTPS)
            .map(|h| h.local_addr)
    }
}

async fn accept_loop(mut acceptor: Box<dyn Acceptor>, shared: Arc<ServerShared>) {
    loop {
        tokio::select! {
            () = shared.graceful.cancelled() => break,
            () = shared.force.cancelled() => break,
            accepted = acceptor.accept() => match accepted {
                Ok(accepted) => {
                    shared.stats.connection_opened();
                    let shared = Arc::clone(&shared);
                    shared.tracker.clone().spawn(async move {
                        handle_connection(accepted, shared).await;
                    });
                }
                Err(error) => {
                    tracing::error!(%error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn conn_ctx(
    shared: &Arc<ServerShared>,
    monitor: Arc<ConnectionMonitor>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    scheme: Scheme,
) -> ConnCtx {
    ConnCtx {
        conf: Arc::clone(&shared.conf),
        chain: Arc::clone(&shared.chain),
        stats: Arc::clone(&shared.stats),
        monitor,
        pool: Arc::clone(&shared.pool),
        remote_addr,
        local_addr,
        scheme,
        graceful: shared.graceful.clone(),
        force: shared.force.clone(),
        app_gate: shared.app_gate.clone(),
    }
}

fn new_monitor(
    protocol: Version,
    cipher: Option<String>,
    tls_protocol: Option<String>,
    remote_addr: SocketAddr,
) -> Arc<ConnectionMonitor> {
    Arc::new(ConnectionMonitor {
        protocol,
        cipher,
        tls_protocol,
        remote_addr,
        started_at: SystemTime::now(),
        completed_requests: std::sync::atomic::AtomicU64::new(0),
        active_requests: std::sync::atomic::AtomicU64::new(0),
    })
}

async fn handle_connection(accepted: Accepted, shared: Arc<ServerShared>) {
    let Accepted {
        stream,
        local_addr,
        remote_addr,
        http_scheme,
    } = accepted;
    match stream {
        IncomingStream::Tcp(tcp) => {
            let _ = tcp.set_nodelay(true);
            let monitor = new_monitor(Version::HTTP_11, None, None, remote_addr);
            let id = shared.registry.register(Arc::clone(&monitor));
            let ctx = conn_ctx(&shared, monitor, remote_addr, local_addr, http_scheme);
            crate::proto::h1::serve_connection(tcp, ctx).await;
            shared.registry.deregister(id);
        }
        #[cfg(feature = "rustls")]
        IncomingStream::Tls(accept) => {
            let handshake =
                tokio::time::timeout(shared.conf.idle_timeout, Box::into_pin(accept)).await;
            let tls_stream = match handshake {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(error)) => {
                    tracing::debug!(%error, "tls handshake failed");
                    shared.stats.connect_failed();
                    shared.stats.connection_closed();
                    return;
                }
                Err(_elapsed) => {
                    tracing::debug!("tls handshake timed out");
                    shared.stats.connect_failed();
                    shared.stats.connection_closed();
                    return;
                }
            };
            let (_, session) = tls_stream.get_ref();
            let alpn = session.alpn_protocol().map(<[u8]>::to_vec);
            let cipher = session
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()));
            let tls_protocol = session.protocol_version().map(|v| format!("{v:?}"));
            let is_h2 = cfg!(feature = "http2") && alpn.as_deref() == Some(b"h2".as_slice());
            let protocol = if is_h2 {
                Version::HTTP_2
            } else {
                Version::HTTP_11
            };
            let monitor = new_monitor(protocol, cipher, tls_protocol, remote_addr);
            let id = shared.registry.register(Arc::clone(&monitor));
            let ctx = conn_ctx(&shared, monitor, remote_addr, local_addr, http_scheme);
            #[cfg(feature = "http2")]
            if is_h2 {
                crate::proto::h2::serve_connection(tls_stream, ctx).await;
                shared.registry.deregister(id);
                shared.stats.connection_closed();
                return;
            }
            crate::proto::h1::serve_connection(tls_stream, ctx).await;
            shared.registry.deregister(id);
        }
    }
    shared.stats.connection_closed();
}
