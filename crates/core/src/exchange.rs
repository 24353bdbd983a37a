//! Per-request exchange lifecycle and the async completion handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::http::body::ReqBody;
use crate::http::{HeaderMap, HeaderValue, StatusCode, Version};
use crate::{Error, Result};

/// Lifecycle of one request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request line and headers parsed.
    RequestHeadersReceived,
    /// Body chunks are flowing to the consumer.
    RequestBodyStreaming,
    /// The full request, trailers included, has been received.
    RequestComplete,
    /// The status line or HEADERS frame reached the socket.
    ResponseHeadersSent,
    /// Response body bytes are flowing.
    ResponseBodyStreaming,
    /// Both sides finished normally.
    Complete,
    /// A handler or protocol error ended the exchange.
    Errored,
    /// A deadline fired.
    TimedOut,
    /// The peer went away first.
    ClientDisconnected,
}

impl ExchangeState {
    /// Whether this state ends the exchange.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Errored | Self::TimedOut | Self::ClientDisconnected
        )
    }
}

/// Where the response output stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum OutputState {
    /// Nothing has been emitted.
    #[default]
    Nothing,
    /// Status and headers went out in a single shot together with the body.
    FullSent,
    /// Status and headers went out; chunks may follow.
    Streaming,
    /// The streaming terminator went out.
    StreamingComplete,
}

impl OutputState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::FullSent | Self::StreamingComplete)
    }
}

/// Status, headers and trailers staged for the wire.
#[derive(Debug, Clone)]
pub(crate) struct ResponseMeta {
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: HeaderMap,
    pub(crate) trailers: HeaderMap,
    pub(crate) version: Version,
}

impl ResponseMeta {
    pub(crate) fn new(version: Version) -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            version,
        }
    }
}

/// How the body follows the emitted headers.
#[derive(Debug)]
pub(crate) enum BodyPlan {
    /// No body at all.
    Empty,
    /// The complete body, written with the headers.
    Full(Bytes),
    /// Chunks follow through `WriteOp::Chunk`.
    Stream,
}

/// One unit of response output, serialized through the exchange channel.
#[derive(Debug)]
pub(crate) enum WriteOp {
    Headers {
        meta: ResponseMeta,
        plan: BodyPlan,
    },
    Chunk(Bytes),
    End {
        trailers: HeaderMap,
    },
    /// The exchange failed after output began; the wire must be torn down
    /// (connection close on H1, stream reset on H2).
    Abort,
}

pub(crate) struct MetaCell {
    pub(crate) meta: ResponseMeta,
    pub(crate) output: OutputState,
}

type CompletionListener = Box<dyn FnOnce(ExchangeState) + Send + 'static>;

/// Shared state backing `Request`, `Response` and `AsyncHandle` for one
/// exchange. The connection driver is the sole owner of the receiving end of
/// `ops_tx`.
pub(crate) struct ExchangeCtx {
    state: Mutex<ExchangeState>,
    terminal_fired: AtomicBool,
    listeners: Mutex<Vec<CompletionListener>>,
    pub(crate) meta: Mutex<MetaCell>,
    ops_tx: mpsc::Sender<WriteOp>,
    async_claimed: AtomicBool,
    async_done: AtomicBool,
    async_error: Mutex<Option<Error>>,
    done_notify: Notify,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for ExchangeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCtx")
            .field("state", &*self.state.lock())
            .field("async_claimed", &self.async_claimed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ExchangeCtx {
    pub(crate) fn new(
        version: Version,
        ops_tx: mpsc::Sender<WriteOp>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExchangeState::RequestHeadersReceived),
            terminal_fired: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            meta: Mutex::new(MetaCell {
                meta: ResponseMeta::new(version),
                output: OutputState::Nothing,
            }),
            ops_tx,
            async_claimed: AtomicBool::new(false),
            async_done: AtomicBool::new(false),
            async_error: Mutex::new(None),
            done_notify: Notify::new(),
            cancel,
        })
    }

    pub(crate) fn state(&self) -> ExchangeState {
        *self.state.lock()
    }

    /// Advances the lifecycle. Terminal states win exactly once and later
    /// transitions of any kind are ignored; non-terminal transitions never
    /// move backwards, so a request-side update arriving after the response
    /// has progressed is dropped.
    pub(crate) fn transition(&self, next: ExchangeState) {
        fn rank(state: ExchangeState) -> u8 {
            match state {
                ExchangeState::RequestHeadersReceived => 0,
                ExchangeState::RequestBodyStreaming => 1,
                ExchangeState::RequestComplete => 2,
                ExchangeState::ResponseHeadersSent => 3,
                ExchangeState::ResponseBodyStreaming => 4,
                _ => 5,
            }
        }
        let fire = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            if !next.is_terminal() && rank(next) < rank(*state) {
                return;
            }
            *state = next;
            next.is_terminal()
        };
        if fire && !self.terminal_fired.swap(true, Ordering::AcqRel) {
            let listeners = std::mem::take(&mut *self.listeners.lock());
            for listener in listeners {
                listener(next);
            }
            self.done_notify.notify_waiters();
        }
    }

    /// Registers a listener for the terminal transition. Fires immediately if
    /// the exchange already ended.
    pub(crate) fn on_complete(&self, listener: CompletionListener) {
        let state = self.state();
        if state.is_terminal() {
            listener(state);
        } else {
            self.listeners.lock().push(listener);
        }
    }

    pub(crate) fn claim_async(&self) -> bool {
        !self.async_claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_async(&self) -> bool {
        self.async_claimed.load(Ordering::Acquire)
    }

    fn finish_async(&self, error: Option<Error>) {
        if self.async_done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(error) = error {
            *self.async_error.lock() = Some(error);
        }
        self.done_notify.notify_waiters();
    }

    pub(crate) fn take_async_error(&self) -> Option<Error> {
        self.async_error.lock().take()
    }

    /// Waits until `complete()` is called on the async handle or the
    /// exchange ends for another reason.
    pub(crate) async fn wait_async_done(&self) {
        loop {
            let notified = self.done_notify.notified();
            if self.async_done.load(Ordering::Acquire) || self.state().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    async fn emit(&self, op: WriteOp) -> Result<()> {
        self.ops_tx.send(op).await.map_err(|_| Error::Disconnected)
    }

    /// Emits the full response in one shot. Fails past any output.
    pub(crate) async fn write_full(&self, body: Bytes) -> Result<()> {
        let op = {
            let mut cell = self.meta.lock();
            if cell.output != OutputState::Nothing {
                return Err(Error::AlreadyCompleted);
            }
            cell.output = OutputState::FullSent;
            if cell.meta.status.is_none() {
                cell.meta.status = Some(StatusCode::OK);
            }
            WriteOp::Headers {
                meta: cell.meta.clone(),
                plan: BodyPlan::Full(body),
            }
        };
        self.emit(op).await
    }

    /// Emits one streamed chunk, sending status and headers first if needed.
    pub(crate) async fn stream_chunk(&self, data: Bytes) -> Result<()> {
        let headers_op = {
            let mut cell = self.meta.lock();
            match cell.output {
                OutputState::Nothing => {
                    cell.output = OutputState::Streaming;
                    if cell.meta.status.is_none() {
                        cell.meta.status = Some(StatusCode::OK);
                    }
                    Some(WriteOp::Headers {
                        meta: cell.meta.clone(),
                        plan: BodyPlan::Stream,
                    })
                }
                OutputState::Streaming => None,
                OutputState::FullSent | OutputState::StreamingComplete => {
                    return Err(Error::AlreadyCompleted)
                }
            }
        };
        if let Some(op) = headers_op {
            self.emit(op).await?;
        }
        self.emit(WriteOp::Chunk(data)).await
    }

    /// Computes whatever is still owed to the peer: headers for an untouched
    /// response (status falls back to 204 without a body), or the terminator
    /// for a streaming one. The connection driver applies the op directly so
    /// it never competes with itself for ops-channel capacity.
    pub(crate) fn finalize_op(&self, staged_body: Option<Bytes>) -> Option<WriteOp> {
        let mut cell = self.meta.lock();
        match cell.output {
            OutputState::Nothing => {
                cell.output = OutputState::FullSent;
                let body = staged_body.unwrap_or_default();
                if cell.meta.status.is_none() {
                    cell.meta.status = Some(if body.is_empty() {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::OK
                    });
                }
                let plan = if body.is_empty() {
                    BodyPlan::Empty
                } else {
                    BodyPlan::Full(body)
                };
                Some(WriteOp::Headers {
                    meta: cell.meta.clone(),
                    plan,
                })
            }
            OutputState::Streaming => {
                cell.output = OutputState::StreamingComplete;
                Some(WriteOp::End {
                    trailers: std::mem::take(&mut cell.meta.trailers),
                })
            }
            OutputState::FullSent | OutputState::StreamingComplete => None,
        }
    }

    /// Whether any response byte has reached the wire path.
    pub(crate) fn response_started(&self) -> bool {
        self.meta.lock().output != OutputState::Nothing
    }

    /// Emitting variant of [`finalize_op`](Self::finalize_op), used by
    /// per-stream exchange tasks that do not own the op receiver.
    pub(crate) async fn finalize_emit(&self, staged_body: Option<Bytes>) -> Result<()> {
        match self.finalize_op(staged_body) {
            Some(op) => self.emit(op).await,
            None => Ok(()),
        }
    }

    /// Signals the wire side to abandon this exchange.
    pub(crate) async fn abort(&self) {
        let _ = self.emit(WriteOp::Abort).await;
    }
}

/// Handle returned by [`Request::handle_async`](crate::Request::handle_async).
///
/// Once claimed, the handler chain owns completion: the response is not
/// finalized when the handler returns, and the connection waits for
/// [`complete`](AsyncHandle::complete). Writes may come from any task or
/// thread; they are serialized in call order.
#[derive(Clone)]
pub struct AsyncHandle {
    ctx: Arc<ExchangeCtx>,
    body: Arc<tokio::sync::Mutex<ReqBody>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle").field("ctx", &self.ctx).finish()
    }
}

impl AsyncHandle {
    pub(crate) fn new(ctx: Arc<ExchangeCtx>, body: ReqBody) -> Self {
        Self {
            ctx,
            body: Arc::new(tokio::sync::Mutex::new(body)),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Sets the response status. Fails once headers have been emitted.
    pub fn status_code(&self, status: StatusCode) -> Result<()> {
        let mut cell = self.ctx.meta.lock();
        if cell.output != OutputState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        cell.meta.status = Some(status);
        Ok(())
    }

    /// Appends a response header. Fails once headers have been emitted.
    pub fn add_header(&self, name: crate::http::HeaderName, value: HeaderValue) -> Result<()> {
        let mut cell = self.ctx.meta.lock();
        if cell.output != OutputState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        cell.meta.headers.append(name, value);
        Ok(())
    }

    /// Sets a response trailer, emitted after the last chunk when trailers
    /// were negotiated.
    pub fn set_trailer(&self, name: crate::http::HeaderName, value: HeaderValue) {
        let mut cell = self.ctx.meta.lock();
        cell.meta.trailers.insert(name, value);
    }

    /// Writes one body chunk, emitting status and headers first if they have
    /// not gone out yet. Writes from different tasks are applied in the
    /// order the calls are made.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let _gate = self.write_gate.lock().await;
        self.ctx.stream_chunk(data).await
    }

    /// Receives the next request body chunk in strict stream order. At most
    /// one outstanding read is possible; concurrent callers queue.
    pub async fn read_body_chunk(&self) -> Result<Option<Bytes>> {
        let mut body = self.body.lock().await;
        body.next_chunk().await
    }

    /// Request trailers, available after the body is fully read.
    pub async fn trailers(&self) -> Option<HeaderMap> {
        let body = self.body.lock().await;
        body.trailers().cloned()
    }

    /// Registers a listener for the exchange's terminal transition.
    pub fn add_response_complete_handler(&self, f: impl FnOnce(ExchangeState) + Send + 'static) {
        self.ctx.on_complete(Box::new(f));
    }

    /// Finishes the exchange successfully. Calling this more than once has
    /// the same effect as calling it once.
    pub fn complete(&self) {
        self.ctx.finish_async(None);
    }

    /// Finishes the exchange with an error, mapped by the same policy as a
    /// handler error. Ignored after a prior completion.
    pub fn complete_with_error(&self, error: Error) {
        self.ctx.finish_async(Some(error));
    }

    /// Aborts the exchange with `503 Service Unavailable` and an optional
    /// `Retry-After` hint.
    pub fn cancel(&self, retry_after: Option<Duration>) {
        {
            let mut cell = self.ctx.meta.lock();
            if cell.output == OutputState::Nothing {
                cell.meta.status = Some(StatusCode::SERVICE_UNAVAILABLE);
                if let Some(retry_after) = retry_after {
                    if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                        cell.meta.headers.insert(http::header::RETRY_AFTER, value);
                    }
                }
            }
        }
        self.ctx.finish_async(Some(Error::Overloaded));
    }
}

/// Creates the ops channel joining response facades to the connection driver.
pub(crate) fn ops_channel() -> (mpsc::Sender<WriteOp>, mpsc::Receiver<WriteOp>) {
    mpsc::channel(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_pair() -> (Arc<ExchangeCtx>, mpsc::Receiver<WriteOp>) {
        let (tx, rx) = ops_channel();
        let ctx = ExchangeCtx::new(Version::HTTP_11, tx, CancellationToken::new());
        (ctx, rx)
    }

    #[test]
    fn test_single_terminal_transition() {
        let (ctx, _rx) = ctx_pair();
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(None));
        let fired2 = Arc::clone(&fired);
        let seen2 = Arc::clone(&seen);
        ctx.on_complete(Box::new(move |state| {
            assert!(!fired2.swap(true, Ordering::SeqCst), "listener fired twice");
            *seen2.lock() = Some(state);
        }));
        ctx.transition(ExchangeState::RequestComplete);
        ctx.transition(ExchangeState::Complete);
        ctx.transition(ExchangeState::Errored);
        ctx.transition(ExchangeState::TimedOut);
        assert_eq!(*seen.lock(), Some(ExchangeState::Complete));
        assert_eq!(ctx.state(), ExchangeState::Complete);
    }

    #[tokio::test]
    async fn test_write_full_then_anything_fails() {
        let (ctx, mut rx) = ctx_pair();
        ctx.write_full(Bytes::from_static(b"hi")).await.expect("first write");
        assert!(matches!(
            ctx.write_full(Bytes::new()).await,
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(
            ctx.stream_chunk(Bytes::new()).await,
            Err(Error::AlreadyCompleted)
        ));
        match rx.recv().await.expect("op") {
            WriteOp::Headers { meta, plan } => {
                assert_eq!(meta.status, Some(StatusCode::OK));
                assert!(matches!(plan, BodyPlan::Full(b) if &b[..] == b"hi"));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_emits_headers_once() {
        let (ctx, mut rx) = ctx_pair();
        ctx.stream_chunk(Bytes::from_static(b"a")).await.expect("chunk");
        ctx.stream_chunk(Bytes::from_static(b"b")).await.expect("chunk");
        assert!(matches!(ctx.finalize_op(None), Some(WriteOp::End { .. })));
        assert!(ctx.finalize_op(None).is_none(), "second finalize is a no-op");
        assert!(matches!(rx.recv().await, Some(WriteOp::Headers { .. })));
        assert!(matches!(rx.recv().await, Some(WriteOp::Chunk(_))));
        assert!(matches!(rx.recv().await, Some(WriteOp::Chunk(_))));
    }

    #[test]
    fn test_finalize_untouched_is_204() {
        let (ctx, _rx) = ctx_pair();
        match ctx.finalize_op(None).expect("op") {
            WriteOp::Headers { meta, plan } => {
                assert_eq!(meta.status, Some(StatusCode::NO_CONTENT));
                assert!(matches!(plan, BodyPlan::Empty));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_async_complete_idempotent() {
        let (ctx, _rx) = ctx_pair();
        let handle = AsyncHandle::new(Arc::clone(&ctx), ReqBody::none());
        assert!(ctx.claim_async());
        assert!(!ctx.claim_async(), "second claim must fail");
        handle.complete();
        handle.complete();
        handle.complete_with_error(Error::Overloaded);
        ctx.wait_async_done().await;
        assert!(ctx.take_async_error().is_none(), "late error must be ignored");
    }
}
