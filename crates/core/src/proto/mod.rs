//! Wire protocol engines.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::conf::ServerConfig;
use crate::http::{Scheme, StatusCode};
use crate::service::HandlerChain;
use crate::stats::{ConnectionMonitor, ServerStats};

pub mod h1;
cfg_feature! {
    #![feature = "http2"]
    pub mod h2;
}

/// Everything a connection driver needs from the server.
pub(crate) struct ConnCtx {
    pub(crate) conf: Arc<ServerConfig>,
    pub(crate) chain: Arc<HandlerChain>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) monitor: Arc<ConnectionMonitor>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) scheme: Scheme,
    /// Server asked for a drain: finish in-flight exchanges, take no new ones.
    pub(crate) graceful: CancellationToken,
    /// Server gave up waiting: drop sockets now.
    pub(crate) force: CancellationToken,
    /// Bounded application executor, when configured.
    pub(crate) app_gate: Option<Arc<Semaphore>>,
}

/// Connection lifecycle, tracked for logging and shutdown decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Open,
    InputClosed,
    OutputClosed,
    FullyClosed,
    Errored,
}

#[cfg(test)]
pub(crate) fn test_conn_ctx(chain: HandlerChain, conf: ServerConfig) -> ConnCtx {
    use std::sync::atomic::AtomicU64;
    use std::time::SystemTime;

    use crate::http::Version;

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    ConnCtx {
        conf: conf.into_shared(),
        chain: Arc::new(chain),
        stats: Arc::new(ServerStats::default()),
        monitor: Arc::new(ConnectionMonitor {
            protocol: Version::HTTP_2,
            cipher: None,
            tls_protocol: None,
            remote_addr: addr,
            started_at: SystemTime::now(),
            completed_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
        }),
        pool: BufferPool::new(crate::buffer::DEFAULT_BUFFER_SIZE, 4),
        remote_addr: addr,
        local_addr: addr,
        scheme: Scheme::HTTPS,
        graceful: CancellationToken::new(),
        force: CancellationToken::new(),
        app_gate: None,
    }
}

/// Result type for wire-level parsing.
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors raised while decoding bytes off the wire.
///
/// These are fatal for the connection: the driver answers with a canned
/// plain-text body where possible and closes.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ParseError {
    /// Syntactically broken message.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The protocol version is not one this server speaks.
    #[error("unsupported http version")]
    InvalidVersion,

    /// A single token outgrew the read buffer.
    #[error("token exceeds buffer capacity")]
    BufferExhausted,

    /// The trailer block exceeded the header byte budget.
    #[error("trailer fields too large")]
    TrailersTooLarge,

    /// The message body exceeded `max_request_size`.
    #[error("request body too large")]
    BodyTooLarge,

    /// The peer closed the stream in the middle of a message.
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl ParseError {
    /// The status the error renders as when a response can still be written.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed(_) | Self::UnexpectedEof => StatusCode::BAD_REQUEST,
            Self::InvalidVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::BufferExhausted | Self::TrailersTooLarge => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}
