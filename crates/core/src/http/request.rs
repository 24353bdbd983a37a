//! HTTP request model.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::exchange::{AsyncHandle, ExchangeCtx};
use crate::http::body::{BodyMode, ReqBody};
use crate::http::{header, header_str, HeaderMap, HeaderValue, Method, Scheme, Version};
use crate::{Error, Result};

/// One parsed request, handed to the handler chain.
///
/// The body is consumed lazily: chunks are pulled from the connection with
/// [`next_chunk`](Request::next_chunk), which also releases inbound
/// flow-control credit.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) raw_query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ReqBody,
    pub(crate) body_mode: BodyMode,
    pub(crate) scheme: Scheme,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) params: HashMap<String, String>,
    pub(crate) ctx: Arc<ExchangeCtx>,
    pub(crate) max_body: u64,
}

impl Request {
    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Normalized relative path, percent-escapes for unreserved characters
    /// decoded.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// The protocol version the request arrived with.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// `http` or `https`.
    #[must_use]
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Request headers, in arrival order per name.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Reads a header as a string.
    #[must_use]
    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// How the body is delimited on the wire.
    #[must_use]
    pub fn body_mode(&self) -> BodyMode {
        self.body_mode
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local listener address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A captured route template parameter, URL-decoded.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Receives the next request body chunk, or `None` once the body is
    /// complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.next_chunk().await
    }

    /// Reads the whole request body into memory, bounded by
    /// `max_request_size`.
    pub async fn read_full_body(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.body.next_chunk().await? {
            if out.len() as u64 + chunk.len() as u64 > self.max_body {
                return Err(Error::Status(
                    crate::http::StatusError::payload_too_large(),
                ));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Trailer fields, available once the body has been read to the end.
    #[must_use]
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.body.trailers()
    }

    /// Whether the client asked for the connection to be closed after this
    /// exchange.
    #[must_use]
    pub fn wants_close(&self) -> bool {
        crate::http::header_contains_token(&self.headers, header::CONNECTION, "close")
    }

    /// Whether the client negotiated response trailers with `TE: trailers`.
    #[must_use]
    pub fn accepts_trailers(&self) -> bool {
        crate::http::header_contains_token(&self.headers, header::TE, "trailers")
    }

    /// Whether `Accept-Encoding` allows a gzip response body.
    #[must_use]
    pub fn accepts_gzip(&self) -> bool {
        crate::http::header_contains_token(&self.headers, header::ACCEPT_ENCODING, "gzip")
    }

    /// Claims asynchronous completion of this exchange.
    ///
    /// After this call the handler chain owns the response: returning from
    /// the handler no longer finalizes anything, and the returned handle must
    /// eventually be completed. Fails on a second claim.
    pub fn handle_async(&mut self) -> Result<AsyncHandle> {
        if !self.ctx.claim_async() {
            return Err(Error::IllegalHandlerState(
                "async completion already claimed for this exchange",
            ));
        }
        let body = std::mem::take(&mut self.body);
        Ok(AsyncHandle::new(Arc::clone(&self.ctx), body))
    }

    /// Registers a listener for the exchange's terminal transition.
    pub fn add_completion_listener(
        &self,
        f: impl FnOnce(crate::ExchangeState) + Send + 'static,
    ) {
        self.ctx.on_complete(Box::new(f));
    }
}

/// Pieces the connection drivers assemble a [`Request`] from.
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) raw_query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    pub(crate) scheme: Scheme,
}

impl Request {
    pub(crate) fn assemble(
        parts: RequestParts,
        body: ReqBody,
        ctx: Arc<ExchangeCtx>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        max_body: u64,
    ) -> Self {
        Self {
            method: parts.method,
            path: parts.path,
            raw_query: parts.raw_query,
            version: parts.version,
            headers: parts.headers,
            body,
            body_mode: parts.body_mode,
            scheme: parts.scheme,
            remote_addr,
            local_addr,
            params: HashMap::new(),
            ctx,
            max_body,
        }
    }

    /// Test-only constructor with an empty body and detached plumbing.
    #[doc(hidden)]
    #[must_use]
    pub fn synthetic(method: Method, path: &str, headers: HeaderMap) -> Self {
        let (ops_tx, _ops_rx) = crate::exchange::ops_channel();
        let ctx = ExchangeCtx::new(
            Version::HTTP_11,
            ops_tx,
            tokio_util::sync::CancellationToken::new(),
        );
        Self {
            method,
            path: path.to_owned(),
            raw_query: None,
            version: Version::HTTP_11,
            headers,
            body: ReqBody::none(),
            body_mode: BodyMode::None,
            scheme: Scheme::HTTP,
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            params: HashMap::new(),
            ctx,
            max_body: u64::MAX,
        }
    }
}
