//! HTTP/1.1 connection driver.
//!
//! One task per connection: it owns the socket, feeds the parser, pumps
//! response ops from the exchange, and applies the timeout and shutdown
//! rules. Handlers run as separate tasks and talk back through the exchange
//! channels.

pub(crate) mod parser;
pub(crate) mod writer;

use std::sync::atomic::Ordering;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::buffer::{ByteCursor, DEFAULT_BUFFER_SIZE};
use crate::conf::TooLargeAction;
use crate::error::TimeoutCause;
use crate::exchange::{ops_channel, BodyPlan, ExchangeCtx, ExchangeState, WriteOp};
use crate::fuse::{ActivityFuse, FuseEvent};
use crate::handler::Outcome;
use crate::http::body::{body_channel, BodyError, BodyEvent, BodySender, ReqBody};
use crate::http::request::RequestParts;
use crate::http::{Method, Request, Response, StatusCode, StatusError};
use crate::proto::{ConnCtx, ConnState, ParseError};
use crate::{catcher, Error};

use parser::{MessageParser, ParseEvent, ParserLimits, RequestHead};
use writer::{ResponseContext, ResponseWriter};

/// How much of an abandoned request body the driver reads past the response
/// before giving up on keep-alive.
const DRAIN_LIMIT: u64 = 256 * 1024;

/// Why the connection is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Disconnected,
    TimedOut(TimeoutCause),
    Errored,
    Forced,
}

impl CloseReason {
    fn exchange_state(self) -> ExchangeState {
        match self {
            Self::Disconnected | Self::Forced => ExchangeState::ClientDisconnected,
            Self::TimedOut(_) => ExchangeState::TimedOut,
            Self::Errored => ExchangeState::Errored,
        }
    }
}

enum ExchangeEnd {
    KeepAlive,
    Close,
}

struct H1Conn<S> {
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    cursor: ByteCursor,
    parser: MessageParser,
    writer: ResponseWriter,
    fuse: std::sync::Arc<ActivityFuse>,
    ctx: ConnCtx,
    state: ConnState,
    served: u64,
}

/// Drives one cleartext or TLS-wrapped HTTP/1.1 connection to completion.
pub(crate) async fn serve_connection<S>(io: S, ctx: ConnCtx)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let limits = ParserLimits {
        max_url_size: ctx.conf.max_url_size,
        max_headers_size: ctx.conf.max_headers_size,
        max_body_size: ctx.conf.max_request_size,
    };
    let fuse = ActivityFuse::new(&ctx.conf);
    let cursor = ByteCursor::with_capacity(DEFAULT_BUFFER_SIZE, ctx.conf.max_buffer_size());
    let writer = ResponseWriter::new(std::sync::Arc::clone(&ctx.conf));
    let (rd, wr) = tokio::io::split(io);
    let mut conn = H1Conn {
        rd,
        wr,
        cursor,
        parser: MessageParser::request(limits),
        writer,
        fuse,
        ctx,
        state: ConnState::Open,
        served: 0,
    };
    conn.run().await;
    let _ = conn.wr.shutdown().await;
    tracing::debug!(remote = %conn.ctx.remote_addr, state = ?conn.state, "connection closed");
}

impl<S> H1Conn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(&mut self) {
        loop {
            let head = match self.next_request().await {
                Some(head) => head,
                None => break,
            };
            self.served += 1;
            match self.run_exchange(*head).await {
                ExchangeEnd::KeepAlive => continue,
                ExchangeEnd::Close => break,
            }
        }
        // Our write side goes down with the function; a peer that already
        // half-closed leaves the connection fully closed.
        self.state = match self.state {
            ConnState::Open => ConnState::OutputClosed,
            ConnState::InputClosed => ConnState::FullyClosed,
            other => other,
        };
    }

    /// Waits for the next request head, applying idle rules between
    /// messages.
    async fn next_request(&mut self) -> Option<Box<RequestHead>> {
        loop {
            match self.parser.poll_event(&mut self.cursor) {
                Ok(Some(ParseEvent::Request(head))) => return Some(head),
                Ok(Some(ParseEvent::Eof)) => return None,
                // Tail events of the previous message that nobody consumed.
                Ok(Some(ParseEvent::EndOfBody | ParseEvent::Trailers(_))) => continue,
                Ok(Some(event)) => {
                    tracing::debug!(?event, "unexpected event between requests");
                    self.state = ConnState::Errored;
                    return None;
                }
                Ok(None) => {}
                Err(error) => {
                    self.reject_parse_error(&error).await;
                    return None;
                }
            }
            if self.state == ConnState::InputClosed {
                return None;
            }
            if !self.cursor.reserve(DEFAULT_BUFFER_SIZE) {
                self.reject_parse_error(&ParseError::BufferExhausted).await;
                return None;
            }
            tokio::select! {
                read = self.rd.read_buf(self.cursor.writable()) => match read {
                    Ok(0) => {
                        self.state = ConnState::InputClosed;
                        match self.parser.on_eof() {
                            Ok(_) => return None,
                            Err(_) => {
                                self.ctx.stats.invalid_request();
                                self.state = ConnState::Errored;
                                return None;
                            }
                        }
                    }
                    Ok(n) => {
                        self.ctx.stats.add_bytes_read(n as u64);
                        self.fuse.event(FuseEvent::Alive);
                    }
                    Err(error) => {
                        tracing::debug!(%error, "socket read failed");
                        self.state = ConnState::Errored;
                        return None;
                    }
                },
                cause = self.fuse.fused() => {
                    if !self.parser.is_idle() {
                        let _ = self
                            .write_canned(&StatusError::from_code(cause.status())
                                .unwrap_or_else(StatusError::request_timeout), true, false)
                            .await;
                    }
                    return None;
                }
                () = self.ctx.force.cancelled() => return None,
                () = self.ctx.graceful.cancelled(), if self.parser.is_idle() => return None,
            }
        }
    }

    /// Responds to a fatal wire error with the canned plain-text body.
    async fn reject_parse_error(&mut self, error: &ParseError) {
        self.ctx.stats.invalid_request();
        self.state = ConnState::Errored;
        let respond = !(matches!(error, ParseError::BodyTooLarge)
            && self.ctx.conf.too_large_action == TooLargeAction::KillConnection);
        if respond {
            let status_error = StatusError::from_code(error.status())
                .unwrap_or_else(StatusError::bad_request)
                .detail(error.to_string());
            let _ = self.write_canned(&status_error, true, false).await;
        }
    }

    /// Writes a complete server-generated response outside any exchange.
    async fn write_canned(
        &mut self,
        error: &StatusError,
        plain: bool,
        keep_alive: bool,
    ) -> Result<(), CloseReason> {
        self.writer.begin(ResponseContext {
            close: !keep_alive,
            ..ResponseContext::default()
        });
        let (meta, body) = if plain {
            catcher::plain_response(error, crate::http::Version::HTTP_11)
        } else {
            catcher::html_response(error, crate::http::Version::HTTP_11)
        };
        let mut out = self.ctx.pool.get();
        if self.writer.write_full(&meta, body, &mut out).is_err() {
            return Err(CloseReason::Disconnected);
        }
        let result = self.write_out(&mut out).await;
        self.ctx.pool.put(out);
        result
    }

    /// Flushes a staging buffer to the socket under the write deadline.
    async fn write_out(&mut self, out: &mut BytesMut) -> Result<(), CloseReason> {
        if out.is_empty() {
            return Ok(());
        }
        self.fuse.event(FuseEvent::WriteStart);
        let result = tokio::select! {
            written = self.wr.write_all(&out[..]) => match written {
                Ok(()) => {
                    self.ctx.stats.add_bytes_sent(out.len() as u64);
                    self.fuse.event(FuseEvent::WriteDone);
                    Ok(())
                }
                Err(_) => Err(CloseReason::Disconnected),
            },
            cause = self.fuse.fused() => Err(CloseReason::TimedOut(cause)),
            () = self.ctx.force.cancelled() => Err(CloseReason::Forced),
        };
        out.clear();
        result
    }

    /// Consumes what remains of an unread request body so the connection can
    /// be reused, up to [`DRAIN_LIMIT`].
    async fn drain_body(&mut self) -> bool {
        let mut drained: u64 = 0;
        loop {
            match self.parser.poll_event(&mut self.cursor) {
                Ok(Some(ParseEvent::BodyChunk { data, .. })) => {
                    drained += data.len() as u64;
                    if drained > DRAIN_LIMIT {
                        return false;
                    }
                }
                Ok(Some(ParseEvent::EndOfBody)) => return true,
                Ok(Some(ParseEvent::Trailers(_))) => {}
                Ok(Some(_)) => return false,
                Ok(None) => {
                    if self.state == ConnState::InputClosed {
                        return false;
                    }
                    if !self.cursor.reserve(DEFAULT_BUFFER_SIZE) {
                        return false;
                    }
                    tokio::select! {
                        read = self.rd.read_buf(self.cursor.writable()) => match read {
                            Ok(0) => {
                                self.state = ConnState::InputClosed;
                                return false;
                            }
                            Ok(n) => self.ctx.stats.add_bytes_read(n as u64),
                            Err(_) => return false,
                        },
                        _ = self.fuse.fused() => return false,
                        () = self.ctx.force.cancelled() => return false,
                    }
                }
                Err(_) => return false,
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_exchange(&mut self, head: RequestHead) -> ExchangeEnd {
        let close_after = head.connection_close
            || self.ctx.graceful.is_cancelled()
            || self.state == ConnState::InputClosed;

        // Requests answered by the core without consulting handlers.
        if let Some(target) = &head.redirect {
            let error = StatusError {
                code: StatusCode::MOVED_PERMANENTLY,
                name: "Moved Permanently".to_owned(),
                brief: "The requested resource lives at the relative form of this target."
                    .to_owned(),
                detail: Some(target.clone()),
                cause: None,
            };
            self.writer.begin(ResponseContext {
                close: close_after,
                ..ResponseContext::default()
            });
            let (mut meta, body) = catcher::html_response(&error, head.version);
            if let Ok(location) = crate::http::HeaderValue::from_str(target) {
                meta.headers.insert(crate::http::header::LOCATION, location);
            }
            let mut out = self.ctx.pool.get();
            let write = self
                .writer
                .write_full(&meta, body, &mut out)
                .map_err(|_| CloseReason::Disconnected);
            let result = match write {
                Ok(()) => self.write_out(&mut out).await,
                Err(reason) => Err(reason),
            };
            self.ctx.pool.put(out);
            if result.is_err() || close_after {
                return ExchangeEnd::Close;
            }
            return self.reuse_or_close(head.body_mode.has_body()).await;
        }
        if let Some(code) = head.rejected {
            self.ctx.stats.invalid_request();
            let error =
                StatusError::from_code(code).unwrap_or_else(StatusError::bad_request);
            // 405 keeps the connection and renders the regular error page;
            // the size violations get the canned plain-text body and a close.
            let keep = code == StatusCode::METHOD_NOT_ALLOWED && !close_after;
            if self.write_canned(&error, !keep, keep).await.is_err() || !keep {
                return ExchangeEnd::Close;
            }
            return self.reuse_or_close(head.body_mode.has_body()).await;
        }
        if head.is_upgrade {
            let error = StatusError::not_implemented()
                .detail("websocket upgrade is not supported");
            let _ = self.write_canned(&error, false, false).await;
            return ExchangeEnd::Close;
        }

        // Application executor gate.
        let _permit = match &self.ctx.app_gate {
            Some(gate) => match std::sync::Arc::clone(gate).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.ctx.stats.rejected_overload();
                    let error = StatusError::service_unavailable();
                    if self.write_canned(&error, false, !close_after).await.is_err() || close_after
                    {
                        return ExchangeEnd::Close;
                    }
                    return self.reuse_or_close(head.body_mode.has_body()).await;
                }
            },
            None => None,
        };

        self.exchange_loop(head, close_after).await
    }

    async fn exchange_loop(&mut self, head: RequestHead, mut close_after: bool) -> ExchangeEnd {
        let has_body = head.body_mode.has_body();
        let head_request = head.method == Method::HEAD;

        let (ops_tx, mut ops_rx) = ops_channel();
        let exchange = ExchangeCtx::new(head.version, ops_tx, self.ctx.force.child_token());
        let (body_tx, body) = if has_body {
            let (tx, rx) = body_channel();
            (Some(tx), ReqBody::stream(rx, None))
        } else {
            (None, ReqBody::none())
        };
        let parts = RequestParts {
            method: head.method.clone(),
            path: head.path,
            raw_query: head.raw_query,
            version: head.version,
            headers: head.headers,
            body_mode: head.body_mode,
            scheme: self.ctx.scheme.clone(),
        };
        let req = Request::assemble(
            parts,
            body,
            std::sync::Arc::clone(&exchange),
            self.ctx.remote_addr,
            self.ctx.local_addr,
            self.ctx.conf.max_request_size,
        );
        let res = Response::new(std::sync::Arc::clone(&exchange));

        self.ctx.stats.request_started();
        self.ctx.monitor.active_requests.fetch_add(1, Ordering::Relaxed);
        if !has_body {
            exchange.transition(ExchangeState::RequestComplete);
        }
        self.writer.begin(ResponseContext {
            head_request,
            close: close_after,
            allow_trailers: crate::http::header_contains_token(
                &req.headers,
                crate::http::header::TE,
                "trailers",
            ),
            accepts_gzip: req.accepts_gzip(),
        });

        let mut out = self.ctx.pool.get();
        if head.expects_continue && has_body {
            out.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
            if self.write_out(&mut out).await.is_err() {
                self.finish_exchange(&exchange, ExchangeState::ClientDisconnected);
                self.ctx.pool.put(out);
                return ExchangeEnd::Close;
            }
        }

        let chain = std::sync::Arc::clone(&self.ctx.chain);
        let mut handler_task: Option<JoinHandle<(Request, Response, crate::Result<Outcome>)>> =
            Some(tokio::spawn(async move {
                let mut req = req;
                let mut res = res;
                let outcome = chain.dispatch(&mut req, &mut res).await;
                (req, res, outcome)
            }));

        let mut body_tx: Option<BodySender> = body_tx;
        let mut pending_body: Option<BodyEvent> = None;
        let mut request_done = !has_body;
        let mut body_discard = false;
        let mut response_done = false;
        let mut async_pending = false;
        let mut handler_res: Option<Response> = None;
        let mut end_state: Option<ExchangeState> = None;

        'pump: loop {
            // Synchronous parser work first, bounded by the pending slot.
            while !request_done && pending_body.is_none() {
                match self.parser.poll_event(&mut self.cursor) {
                    Ok(Some(ParseEvent::BodyChunk { data, .. })) => {
                        self.fuse.event(FuseEvent::BodyProgress);
                        if !body_discard {
                            pending_body = Some(BodyEvent::Data(data));
                        }
                    }
                    Ok(Some(ParseEvent::Trailers(trailers))) => {
                        if !body_discard {
                            pending_body = Some(BodyEvent::Trailers(trailers));
                        }
                    }
                    Ok(Some(ParseEvent::EndOfBody)) => {
                        request_done = true;
                        body_tx.take();
                        exchange.transition(ExchangeState::RequestComplete);
                        self.fuse.event(FuseEvent::BodyProgress);
                    }
                    Ok(Some(event)) => {
                        tracing::debug!(?event, "unexpected event inside request body");
                        request_done = true;
                        body_tx.take();
                    }
                    Ok(None) => break,
                    Err(error) => {
                        self.ctx.stats.invalid_request();
                        close_after = true;
                        request_done = true;
                        let body_error = match &error {
                            ParseError::BodyTooLarge => BodyError::TooLarge,
                            _ => BodyError::Disconnected,
                        };
                        if let Some(tx) = body_tx.take() {
                            let _ = tx.try_send(BodyEvent::Error(body_error));
                        }
                        if matches!(error, ParseError::BodyTooLarge)
                            && self.ctx.conf.too_large_action == TooLargeAction::KillConnection
                        {
                            end_state = Some(ExchangeState::Errored);
                            break 'pump;
                        }
                        self.state = ConnState::Errored;
                    }
                }
            }

            // Finished when the wire is settled and the application is done.
            if response_done
                && (request_done || body_discard)
                && handler_task.is_none()
                && !async_pending
            {
                break 'pump;
            }

            let can_read = !request_done
                && pending_body.is_none()
                && self.state != ConnState::InputClosed
                && self.state != ConnState::Errored;
            if can_read && !self.cursor.reserve(DEFAULT_BUFFER_SIZE) {
                self.ctx.stats.invalid_request();
                end_state = Some(ExchangeState::Errored);
                break 'pump;
            }
            if pending_body.is_some() && body_tx.is_none() {
                pending_body = None;
                continue;
            }
            if !request_done {
                self.fuse.event(FuseEvent::AwaitingBody);
            }

            tokio::select! {
                // Response output from the handler side.
                op = ops_rx.recv() => {
                    let Some(op) = op else { continue };
                    match self.apply_write_op(op, &exchange, &mut out).await {
                        Ok(done) => response_done = response_done || done,
                        Err(reason) => {
                            end_state = Some(reason.exchange_state());
                            break 'pump;
                        }
                    }
                }
                // Forward a parsed body frame once the consumer has room.
                permit = async {
                    let tx = body_tx.as_ref().expect("guarded").clone();
                    tx.reserve_owned().await
                },
                    if pending_body.is_some() && body_tx.is_some() =>
                {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = pending_body.take() {
                                permit.send(event);
                            }
                            exchange.transition(ExchangeState::RequestBodyStreaming);
                        }
                        Err(_) => {
                            // Consumer dropped the body; discard the rest.
                            body_discard = true;
                            body_tx = None;
                            pending_body = None;
                        }
                    }
                }
                // More request bytes.
                read = self.rd.read_buf(self.cursor.writable()), if can_read => match read {
                    Ok(0) => {
                        self.state = ConnState::InputClosed;
                        close_after = true;
                        if self.parser.on_eof().is_err() {
                            request_done = true;
                            if let Some(tx) = body_tx.take() {
                                let _ = tx.try_send(BodyEvent::Error(BodyError::Disconnected));
                            }
                        }
                    }
                    Ok(n) => {
                        self.ctx.stats.add_bytes_read(n as u64);
                        self.fuse.event(FuseEvent::Alive);
                    }
                    Err(_) => {
                        end_state = Some(ExchangeState::ClientDisconnected);
                        break 'pump;
                    }
                },
                // Handler finished.
                joined = async { handler_task.as_mut().expect("guarded").await },
                    if handler_task.is_some() =>
                {
                    handler_task = None;
                    // Apply already queued ops first so a direct finalize
                    // cannot overtake them.
                    match self.drain_ops(&mut ops_rx, &exchange, &mut out).await {
                        Ok(done) => response_done = response_done || done,
                        Err(reason) => {
                            end_state = Some(reason.exchange_state());
                            break 'pump;
                        }
                    }
                    let (mut res, outcome) = match joined {
                        Ok((_req, res, outcome)) => (res, outcome),
                        Err(join_error) => {
                            tracing::error!(%join_error, "handler task failed");
                            (
                                Response::new(std::sync::Arc::clone(&exchange)),
                                Err(Error::other("handler task failed")),
                            )
                        }
                    };
                    match self.conclude_handler(&exchange, &mut res, outcome) {
                        HandlerVerdict::Emit(op) => {
                            if let Some(op) = op {
                                match self.apply_write_op(op, &exchange, &mut out).await {
                                    Ok(done) => response_done = response_done || done,
                                    Err(reason) => {
                                        end_state = Some(reason.exchange_state());
                                        break 'pump;
                                    }
                                }
                            }
                            handler_res = Some(res);
                        }
                        HandlerVerdict::AsyncPending => {
                            async_pending = true;
                            handler_res = Some(res);
                        }
                        HandlerVerdict::Close(state) => {
                            end_state = Some(state);
                            break 'pump;
                        }
                    }
                }
                // Async completion.
                () = exchange.wait_async_done(), if async_pending => {
                    async_pending = false;
                    match self.drain_ops(&mut ops_rx, &exchange, &mut out).await {
                        Ok(done) => response_done = response_done || done,
                        Err(reason) => {
                            end_state = Some(reason.exchange_state());
                            break 'pump;
                        }
                    }
                    if let Some(error) = exchange.take_async_error() {
                        let res = handler_res
                            .get_or_insert_with(|| Response::new(std::sync::Arc::clone(&exchange)));
                        if res.is_started() || !self.ctx.chain.render_error(&error, res) {
                            end_state = Some(ExchangeState::Errored);
                            break 'pump;
                        }
                        close_after = true;
                    }
                    let staged = handler_res.as_mut().and_then(Response::take_staged);
                    if let Some(op) = exchange.finalize_op(staged) {
                        match self.apply_write_op(op, &exchange, &mut out).await {
                            Ok(done) => response_done = response_done || done,
                            Err(reason) => {
                                end_state = Some(reason.exchange_state());
                                break 'pump;
                            }
                        }
                    }
                }
                // Deadlines.
                cause = self.fuse.fused() => {
                    exchange.transition(ExchangeState::TimedOut);
                    if !exchange.response_started() {
                        let error = StatusError::from_code(cause.status())
                            .unwrap_or_else(StatusError::request_timeout);
                        let _ = self.write_canned(&error, false, false).await;
                    }
                    if let Some(tx) = body_tx.take() {
                        let _ = tx.try_send(BodyEvent::Error(BodyError::TimedOut));
                    }
                    end_state = Some(ExchangeState::TimedOut);
                    break 'pump;
                }
                // Forced shutdown.
                () = self.ctx.force.cancelled() => {
                    end_state = Some(ExchangeState::ClientDisconnected);
                    break 'pump;
                }
            }
        }
        self.ctx.pool.put(out);

        let final_state = end_state.unwrap_or(ExchangeState::Complete);
        if final_state != ExchangeState::Complete {
            exchange.cancel.cancel();
            if let Some(tx) = body_tx.take() {
                let _ = tx.try_send(BodyEvent::Error(BodyError::Disconnected));
            }
        }
        self.finish_exchange(&exchange, final_state);

        if final_state != ExchangeState::Complete {
            self.state = if final_state == ExchangeState::Errored {
                ConnState::Errored
            } else {
                self.state
            };
            return ExchangeEnd::Close;
        }
        if close_after || self.state == ConnState::InputClosed {
            return ExchangeEnd::Close;
        }
        if let Some(cap) = self.ctx.conf.max_keepalive_requests {
            if self.served >= cap {
                return ExchangeEnd::Close;
            }
        }
        self.reuse_or_close(!(request_done && !body_discard)).await
    }

    /// Applies one response op to the wire. `Ok(true)` means the response is
    /// complete.
    async fn apply_write_op(
        &mut self,
        op: WriteOp,
        exchange: &std::sync::Arc<ExchangeCtx>,
        out: &mut BytesMut,
    ) -> Result<bool, CloseReason> {
        let done = match op {
            WriteOp::Headers { meta, plan } => match plan {
                BodyPlan::Full(body) => {
                    self.writer
                        .write_full(&meta, body, out)
                        .map_err(|_| CloseReason::Errored)?;
                    exchange.transition(ExchangeState::ResponseHeadersSent);
                    true
                }
                BodyPlan::Empty => {
                    self.writer
                        .write_full(&meta, Bytes::new(), out)
                        .map_err(|_| CloseReason::Errored)?;
                    exchange.transition(ExchangeState::ResponseHeadersSent);
                    true
                }
                BodyPlan::Stream => {
                    self.writer
                        .write_streaming_headers(&meta, out)
                        .map_err(|_| CloseReason::Errored)?;
                    exchange.transition(ExchangeState::ResponseHeadersSent);
                    false
                }
            },
            WriteOp::Chunk(data) => {
                self.writer
                    .write_chunk(data, out)
                    .map_err(|_| CloseReason::Errored)?;
                exchange.transition(ExchangeState::ResponseBodyStreaming);
                false
            }
            WriteOp::End { trailers } => {
                self.writer
                    .finish(&trailers, out)
                    .map_err(|_| CloseReason::Errored)?;
                true
            }
            WriteOp::Abort => return Err(CloseReason::Errored),
        };
        self.write_out(out).await?;
        Ok(done)
    }

    /// Drains already queued response ops without blocking.
    async fn drain_ops(
        &mut self,
        ops_rx: &mut tokio::sync::mpsc::Receiver<WriteOp>,
        exchange: &std::sync::Arc<ExchangeCtx>,
        out: &mut BytesMut,
    ) -> Result<bool, CloseReason> {
        let mut done = false;
        while let Ok(op) = ops_rx.try_recv() {
            done = self.apply_write_op(op, exchange, out).await? || done;
        }
        Ok(done)
    }

    fn conclude_handler(
        &mut self,
        exchange: &std::sync::Arc<ExchangeCtx>,
        res: &mut Response,
        outcome: crate::Result<Outcome>,
    ) -> HandlerVerdict {
        match outcome {
            Ok(Outcome::Handled) => {
                if exchange.is_async() {
                    return HandlerVerdict::AsyncPending;
                }
                HandlerVerdict::Emit(exchange.finalize_op(res.take_staged()))
            }
            Ok(Outcome::NotHandled) => {
                if res.is_started() {
                    return HandlerVerdict::Close(ExchangeState::Errored);
                }
                let error = StatusError::not_found();
                let _ = res.status_code(error.code);
                res.html(catcher::error_page(&error));
                HandlerVerdict::Emit(exchange.finalize_op(res.take_staged()))
            }
            Err(error) => {
                if res.is_started() || !self.ctx.chain.render_error(&error, res) {
                    tracing::error!(%error, "handler failed; closing connection");
                    return HandlerVerdict::Close(ExchangeState::Errored);
                }
                HandlerVerdict::Emit(exchange.finalize_op(res.take_staged()))
            }
        }
    }

    fn finish_exchange(&self, exchange: &std::sync::Arc<ExchangeCtx>, state: ExchangeState) {
        exchange.transition(state);
        let completed = exchange.state() == ExchangeState::Complete;
        self.ctx.stats.request_ended(completed);
        self.ctx
            .monitor
            .active_requests
            .fetch_sub(1, Ordering::Relaxed);
        if completed {
            self.ctx
                .monitor
                .completed_requests
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decides keep-alive after a finished exchange with possibly unread
    /// body bytes.
    async fn reuse_or_close(&mut self, body_unread: bool) -> ExchangeEnd {
        if body_unread && !self.drain_body().await {
            return ExchangeEnd::Close;
        }
        if self.ctx.graceful.is_cancelled() || self.ctx.force.is_cancelled() {
            return ExchangeEnd::Close;
        }
        ExchangeEnd::KeepAlive
    }
}

enum HandlerVerdict {
    /// Apply this finishing op, if any; the ops channel carries the rest.
    Emit(Option<WriteOp>),
    AsyncPending,
    Close(ExchangeState),
}
