//! HTTP response model.

use std::sync::Arc;

use bytes::Bytes;

use crate::exchange::{ExchangeCtx, OutputState};
use crate::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use crate::{Error, Result};

/// The response side of one exchange.
///
/// Status and headers stay mutable until the first byte goes out; afterwards
/// mutation fails with [`Error::AlreadyCompleted`]. Two write styles exist:
///
/// - buffered: [`body`](Response::body) stages bytes that are emitted when
///   the handler returns, letting the handler keep adjusting status and
///   headers;
/// - immediate: [`write`](Response::write) emits the complete response in
///   one shot, and [`send_chunk`](Response::send_chunk) switches to streamed
///   output.
pub struct Response {
    pub(crate) ctx: Arc<ExchangeCtx>,
    pub(crate) staged: Option<Bytes>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("ctx", &self.ctx)
            .field("staged", &self.staged.as_ref().map(Bytes::len))
            .finish()
    }
}

impl Response {
    pub(crate) fn new(ctx: Arc<ExchangeCtx>) -> Self {
        Self { ctx, staged: None }
    }

    /// The response protocol version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.ctx.meta.lock().meta.version
    }

    /// The explicit status, if one has been set.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.ctx.meta.lock().meta.status
    }

    /// Sets the status code. Fails once headers have been emitted.
    pub fn status_code(&mut self, status: StatusCode) -> Result<&mut Self> {
        let mut cell = self.ctx.meta.lock();
        if cell.output != OutputState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        cell.meta.status = Some(status);
        drop(cell);
        Ok(self)
    }

    /// Sets a header, replacing previous values. Fails once headers have
    /// been emitted.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<&mut Self> {
        let mut cell = self.ctx.meta.lock();
        if cell.output != OutputState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        cell.meta.headers.insert(name, value);
        drop(cell);
        Ok(self)
    }

    /// Appends a header value. Fails once headers have been emitted.
    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<&mut Self> {
        let mut cell = self.ctx.meta.lock();
        if cell.output != OutputState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        cell.meta.headers.append(name, value);
        drop(cell);
        Ok(self)
    }

    /// Reads back a staged header value.
    #[must_use]
    pub fn header(&self, name: HeaderName) -> Option<HeaderValue> {
        self.ctx.meta.lock().meta.headers.get(name).cloned()
    }

    /// A copy of the currently staged headers.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.ctx.meta.lock().meta.headers.clone()
    }

    /// Sets a trailer field, emitted after the last chunk when the client
    /// negotiated `TE: trailers` on a chunked response.
    pub fn set_trailer(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.ctx.meta.lock().meta.trailers.insert(name, value);
        self
    }

    /// Stages body bytes to be emitted when the handler returns.
    pub fn body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.staged = Some(body.into());
        self
    }

    /// Stages a plain-text body, setting `Content-Type` if absent.
    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        {
            let mut cell = self.ctx.meta.lock();
            if !cell.meta.headers.contains_key(header::CONTENT_TYPE) {
                cell.meta.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain;charset=utf-8"),
                );
            }
        }
        self.staged = Some(Bytes::from(text.into()));
        self
    }

    /// Stages an HTML body, setting `Content-Type` if absent.
    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        {
            let mut cell = self.ctx.meta.lock();
            if !cell.meta.headers.contains_key(header::CONTENT_TYPE) {
                cell.meta.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/html;charset=utf-8"),
                );
            }
        }
        self.staged = Some(Bytes::from(html.into()));
        self
    }

    /// Writes the complete response now: status, headers and the given body
    /// in one shot. Any later write fails with
    /// [`Error::AlreadyCompleted`].
    pub async fn write(&mut self, body: impl Into<Bytes>) -> Result<()> {
        self.ctx.write_full(body.into()).await
    }

    /// Writes one streamed body chunk, emitting status and headers first if
    /// they have not gone out yet. Without an explicit `Content-Length` the
    /// response becomes chunked.
    pub async fn send_chunk(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.ctx.stream_chunk(data.into()).await
    }

    /// Whether response bytes have already been emitted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.ctx.response_started()
    }

    /// Registers a listener for the exchange's terminal transition.
    pub fn add_completion_listener(
        &self,
        f: impl FnOnce(crate::ExchangeState) + Send + 'static,
    ) {
        self.ctx.on_complete(Box::new(f));
    }

    pub(crate) fn take_staged(&mut self) -> Option<Bytes> {
        self.staged.take()
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::exchange::{ops_channel, WriteOp};

    fn fresh() -> (Response, tokio::sync::mpsc::Receiver<WriteOp>) {
        let (tx, rx) = ops_channel();
        let ctx = ExchangeCtx::new(Version::HTTP_11, tx, CancellationToken::new());
        (Response::new(ctx), rx)
    }

    #[tokio::test]
    async fn test_headers_frozen_after_write() {
        let (mut res, _rx) = fresh();
        res.set_header(header::ETAG, "\"abc\"".parse().expect("value"))
            .expect("mutable");
        res.write("hello").await.expect("write");
        assert!(matches!(
            res.status_code(StatusCode::IM_A_TEAPOT),
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(
            res.set_header(header::ETAG, "\"x\"".parse().expect("value")),
            Err(Error::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn test_staged_text_sets_content_type() {
        let (mut res, _rx) = fresh();
        res.text("hi");
        assert_eq!(
            res.header(header::CONTENT_TYPE),
            Some(HeaderValue::from_static("text/plain;charset=utf-8"))
        );
        assert_eq!(res.take_staged(), Some(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn test_send_chunk_streams() {
        let (mut res, mut rx) = fresh();
        res.send_chunk("a").await.expect("chunk");
        assert!(matches!(rx.recv().await, Some(WriteOp::Headers { .. })));
        assert!(matches!(rx.recv().await, Some(WriteOp::Chunk(_))));
        assert!(res.is_started());
    }
}
