//! HTTP/2 connection driver (RFC 7540).
//!
//! One task per connection owns the socket, the frame codec and the HPACK
//! state. Each accepted stream spawns an exchange task; stream output comes
//! back through per-stream op channels and is flow-control scheduled here,
//! so one stalled stream never blocks another.

pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod streams;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::buffer::{ByteCursor, DEFAULT_BUFFER_SIZE};
use crate::conf::TooLargeAction;
use crate::exchange::{ops_channel, BodyPlan, ExchangeCtx, ExchangeState, ResponseMeta, WriteOp};
use crate::fuse::{ActivityFuse, FuseEvent};
use crate::handler::Outcome;
use crate::http::body::{body_channel, BodyError, BodyEvent, BodyMode, ReqBody};
use crate::http::request::RequestParts;
use crate::http::{
    header, status_forbids_body, HeaderMap, HeaderName, HeaderValue, Method, Request, Response,
    Scheme, StatusCode, StatusError, Version,
};
use crate::proto::ConnCtx;
use crate::service::HandlerChain;

use flow::FlowWindow;
use frame::{ErrorCode, Frame, H2Error, Settings};
use streams::{StreamEntry, StreamState, StreamTable, StreamWork};

/// Our HPACK dynamic table bound, advertised in SETTINGS.
const HEADER_TABLE_SIZE: u32 = 4096;

/// Raw bound on an assembled HEADERS + CONTINUATION sequence.
const MAX_HEADER_BLOCK: usize = 1 << 20;

struct Continuation {
    stream_id: u32,
    fragments: BytesMut,
    end_stream: bool,
}

struct H2Conn<S> {
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    cursor: ByteCursor,
    ctx: ConnCtx,
    fuse: Arc<ActivityFuse>,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    table: StreamTable,
    conn_recv: FlowWindow,
    conn_send: FlowWindow,
    peer_initial_window: u32,
    peer_max_frame: u32,
    draining: bool,
    out: BytesMut,
}

/// Drives one ALPN-negotiated HTTP/2 connection to completion.
pub(crate) async fn serve_connection<S>(io: S, ctx: ConnCtx)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let fuse = ActivityFuse::new(&ctx.conf);
    let cursor = ByteCursor::with_capacity(
        DEFAULT_BUFFER_SIZE,
        frame::FRAME_HEADER_LEN + frame::DEFAULT_MAX_FRAME_SIZE as usize,
    );
    let decoder = hpack::Decoder::new(HEADER_TABLE_SIZE as usize, ctx.conf.max_headers_size);
    let mut staged = ctx.pool.get();
    staged.clear();
    let pool = Arc::clone(&ctx.pool);
    let remote_addr = ctx.remote_addr;
    let (rd, wr) = tokio::io::split(io);
    let mut conn = H2Conn {
        rd,
        wr,
        cursor,
        ctx,
        fuse,
        decoder,
        encoder: hpack::Encoder::new(),
        table: StreamTable::default(),
        conn_recv: FlowWindow::new(frame::DEFAULT_INITIAL_WINDOW),
        conn_send: FlowWindow::new(frame::DEFAULT_INITIAL_WINDOW),
        peer_initial_window: frame::DEFAULT_INITIAL_WINDOW,
        peer_max_frame: frame::DEFAULT_MAX_FRAME_SIZE,
        draining: false,
        out: staged,
    };
    conn.run().await;
    pool.put(std::mem::take(&mut conn.out));
    let _ = conn.wr.shutdown().await;
    tracing::debug!(remote = %remote_addr, "h2 connection closed");
}

impl<S> H2Conn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(&mut self) {
        if !self.read_preface().await {
            self.ctx.stats.invalid_request();
            return;
        }
        frame::write_settings(
            &mut self.out,
            &Settings {
                header_table_size: Some(HEADER_TABLE_SIZE),
                max_concurrent_streams: Some(self.ctx.conf.max_concurrent_streams),
                max_header_list_size: Some(self.ctx.conf.max_headers_size as u32),
                ..Settings::default()
            },
        );
        if self.flush_wire().await.is_err() {
            return;
        }

        let mut continuation: Option<Continuation> = None;
        let result: Result<(), H2Error> = loop {
            if self.draining && self.table.is_empty() {
                break Ok(());
            }
            if !self.cursor.reserve(DEFAULT_BUFFER_SIZE) {
                break Err(H2Error::frame_size("frame larger than the read buffer"));
            }
            tokio::select! {
                read = self.rd.read_buf(self.cursor.writable()) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        self.ctx.stats.add_bytes_read(n as u64);
                        self.fuse.event(FuseEvent::Alive);
                        if let Err(error) = self.consume_frames(&mut continuation) {
                            break Err(error);
                        }
                    }
                    Err(_) => break Ok(()),
                },
                work = futures_util::future::poll_fn(|cx| self.table.poll_work(cx)) => {
                    let result = match work {
                        StreamWork::Op(id, op) => self.handle_stream_op(id, op),
                        StreamWork::Credit(id, n) => self.handle_credit(id, n),
                    };
                    if let Err(error) = result {
                        break Err(error);
                    }
                }
                cause = self.fuse.fused() => {
                    tracing::debug!(?cause, "h2 connection timed out");
                    frame::write_goaway(&mut self.out, self.table.last_processed, ErrorCode::NoError);
                    let _ = self.flush_wire().await;
                    self.close_all_streams(ExchangeState::TimedOut);
                    return;
                }
                () = self.ctx.graceful.cancelled(), if !self.draining => {
                    self.draining = true;
                    frame::write_goaway(&mut self.out, self.table.last_processed, ErrorCode::NoError);
                }
                () = self.ctx.force.cancelled() => {
                    self.close_all_streams(ExchangeState::ClientDisconnected);
                    return;
                }
            }
            self.reap_streams();
            if self.flush_wire().await.is_err() {
                self.close_all_streams(ExchangeState::ClientDisconnected);
                return;
            }
        };

        if let Err(error) = result {
            tracing::debug!(?error, "h2 connection error");
            self.ctx.stats.invalid_request();
            frame::write_goaway(&mut self.out, self.table.last_processed, error.code);
            let _ = self.flush_wire().await;
        }
        self.close_all_streams(ExchangeState::ClientDisconnected);
    }

    async fn read_preface(&mut self) -> bool {
        loop {
            if self.cursor.remaining() >= frame::CONNECTION_PREFACE.len() {
                let got = self.cursor.take_bytes(frame::CONNECTION_PREFACE.len());
                return &got[..] == frame::CONNECTION_PREFACE;
            }
            if !self.cursor.reserve(64) {
                return false;
            }
            tokio::select! {
                read = self.rd.read_buf(self.cursor.writable()) => match read {
                    Ok(0) | Err(_) => return false,
                    Ok(n) => self.ctx.stats.add_bytes_read(n as u64),
                },
                _ = self.fuse.fused() => return false,
                () = self.ctx.force.cancelled() => return false,
            }
        }
    }

    async fn flush_wire(&mut self) -> Result<(), ()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.fuse.event(FuseEvent::WriteStart);
        let result = tokio::select! {
            written = self.wr.write_all(&self.out[..]) => match written {
                Ok(()) => {
                    self.ctx.stats.add_bytes_sent(self.out.len() as u64);
                    self.fuse.event(FuseEvent::WriteDone);
                    Ok(())
                }
                Err(_) => Err(()),
            },
            _ = self.fuse.fused() => Err(()),
            () = self.ctx.force.cancelled() => Err(()),
        };
        self.out.clear();
        result
    }

    fn consume_frames(&mut self, continuation: &mut Option<Continuation>) -> Result<(), H2Error> {
        loop {
            let frame = match frame::read_frame(&mut self.cursor, frame::DEFAULT_MAX_FRAME_SIZE)? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            // A started header block must be contiguous.
            if let Some(pending) = continuation.take() {
                match frame {
                    Frame::Continuation {
                        stream_id,
                        fragment,
                        end_headers,
                    } if stream_id == pending.stream_id => {
                        let mut pending = pending;
                        if pending.fragments.len() + fragment.len() > MAX_HEADER_BLOCK {
                            return Err(H2Error::frame_size("header block too large"));
                        }
                        pending.fragments.extend_from_slice(&fragment);
                        if end_headers {
                            self.process_headers(
                                pending.stream_id,
                                pending.fragments.freeze(),
                                pending.end_stream,
                            )?;
                        } else {
                            *continuation = Some(pending);
                        }
                        continue;
                    }
                    _ => {
                        return Err(H2Error::protocol(
                            "header block interrupted by another frame",
                        ))
                    }
                }
            }
            match frame {
                Frame::Settings { ack: true, .. } => {}
                Frame::Settings {
                    ack: false,
                    settings,
                } => {
                    self.apply_settings(&settings);
                    frame::write_settings_ack(&mut self.out);
                }
                Frame::Ping { ack: false, payload } => {
                    frame::write_ping_ack(&mut self.out, payload);
                }
                Frame::Ping { ack: true, .. } => {}
                Frame::WindowUpdate {
                    stream_id: 0,
                    increment,
                } => {
                    self.conn_send.expand(increment).map_err(|()| H2Error {
                        code: ErrorCode::FlowControl,
                        reason: "connection window overflow",
                    })?;
                    let ids: Vec<u32> = self.table.iter_mut().map(|s| s.id).collect();
                    for id in ids {
                        self.flush_stream_output(id);
                    }
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                } => {
                    let overflow = match self.table.get_mut(stream_id) {
                        Some(stream) => stream.send_window.expand(increment).is_err(),
                        None => false,
                    };
                    if overflow {
                        self.reset_stream(stream_id, ErrorCode::FlowControl);
                    } else {
                        self.flush_stream_output(stream_id);
                    }
                }
                Frame::Data {
                    stream_id,
                    data,
                    end_stream,
                    flow_len,
                } => {
                    self.handle_data(stream_id, data, end_stream, flow_len)?;
                }
                Frame::Headers {
                    stream_id,
                    fragment,
                    end_headers,
                    end_stream,
                } => {
                    if end_headers {
                        self.process_headers(stream_id, fragment, end_stream)?;
                    } else {
                        let mut fragments = BytesMut::new();
                        fragments.extend_from_slice(&fragment);
                        *continuation = Some(Continuation {
                            stream_id,
                            fragments,
                            end_stream,
                        });
                    }
                }
                Frame::Continuation { .. } => {
                    return Err(H2Error::protocol("CONTINUATION without open header block"));
                }
                Frame::Reset { stream_id, .. } => {
                    if let Some(stream) = self.table.get_mut(stream_id) {
                        stream.state = StreamState::Closed;
                        if let Some(tx) = stream.body_tx.take() {
                            let _ = tx.try_send(BodyEvent::Error(BodyError::Disconnected));
                        }
                        stream.exchange.cancel.cancel();
                        stream
                            .exchange
                            .transition(ExchangeState::ClientDisconnected);
                    }
                }
                Frame::PushPromise { .. } => {
                    return Err(H2Error::protocol("PUSH_PROMISE from a client"));
                }
                Frame::GoAway { .. } => {
                    self.draining = true;
                }
                Frame::Priority { .. } | Frame::Unknown { .. } => {}
            }
        }
    }

    fn apply_settings(&mut self, settings: &Settings) {
        if let Some(initial) = settings.initial_window_size {
            let delta = i64::from(initial) - i64::from(self.peer_initial_window);
            self.peer_initial_window = initial;
            for stream in self.table.iter_mut() {
                stream.send_window.adjust(delta);
            }
        }
        if let Some(max_frame) = settings.max_frame_size {
            self.peer_max_frame = max_frame;
        }
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), H2Error> {
        self.conn_recv.consume(flow_len).map_err(|()| H2Error {
            code: ErrorCode::FlowControl,
            reason: "connection receive window overrun",
        })?;
        let max_body = self.ctx.conf.max_request_size;
        if self.table.get_mut(stream_id).is_none() {
            if stream_id > self.table.highest_seen {
                return Err(H2Error::protocol("DATA on an idle stream"));
            }
            // Stream already closed locally; give the credit straight back.
            self.conn_recv.expand(flow_len).ok();
            frame::write_window_update(&mut self.out, 0, flow_len);
            return Ok(());
        }

        let window_overrun = {
            let stream = self.table.get_mut(stream_id).expect("present");
            stream.recv_window.consume(flow_len).is_err()
        };
        if window_overrun {
            self.reset_stream(stream_id, ErrorCode::FlowControl);
            return Ok(());
        }

        let too_large = {
            let stream = self.table.get_mut(stream_id).expect("present");
            stream.body_bytes_seen += u64::from(flow_len);
            stream.body_bytes_seen > max_body
        };
        if too_large {
            match self.ctx.conf.too_large_action {
                TooLargeAction::KillConnection => {
                    return Err(H2Error {
                        code: ErrorCode::EnhanceYourCalm,
                        reason: "request body too large",
                    });
                }
                TooLargeAction::SendResponse => {
                    let started = {
                        let stream = self.table.get_mut(stream_id).expect("present");
                        if let Some(tx) = stream.body_tx.take() {
                            let _ = tx.try_send(BodyEvent::Error(BodyError::TooLarge));
                        }
                        stream.response_headers_sent
                    };
                    if !started {
                        self.respond_canned(stream_id, &StatusError::payload_too_large(), true);
                    }
                    self.reset_stream(stream_id, ErrorCode::Cancel);
                    return Ok(());
                }
            }
        }

        self.fuse.event(FuseEvent::BodyProgress);
        let stream = self.table.get_mut(stream_id).expect("present");
        if !data.is_empty() {
            stream.inbound.push_back(BodyEvent::Data(data));
        }
        if end_stream {
            stream.state = match stream.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
            stream.exchange.transition(ExchangeState::RequestComplete);
        } else {
            stream
                .exchange
                .transition(ExchangeState::RequestBodyStreaming);
        }
        stream.flush_inbound();
        self.update_body_fuse();
        Ok(())
    }

    fn handle_credit(&mut self, stream_id: u32, n: u32) -> Result<(), H2Error> {
        if self.conn_recv.expand(n).is_ok() {
            frame::write_window_update(&mut self.out, 0, n);
        }
        if let Some(stream) = self.table.get_mut(stream_id) {
            let live = !matches!(stream.state, StreamState::Closed);
            if stream.recv_window.expand(n).is_ok() && live {
                frame::write_window_update(&mut self.out, stream_id, n);
            }
            stream.flush_inbound();
        }
        Ok(())
    }

    fn handle_stream_op(&mut self, stream_id: u32, op: WriteOp) -> Result<(), H2Error> {
        let Some(head_request) = self.table.get_mut(stream_id).map(|s| s.head_request) else {
            return Ok(());
        };
        match op {
            WriteOp::Headers { meta, plan } => {
                let status = meta.status.unwrap_or(StatusCode::OK);
                let suppress = head_request || status_forbids_body(status);
                match plan {
                    BodyPlan::Full(body) => {
                        // HEAD mirrors the GET headers: the declared length
                        // is the unsuppressed body's.
                        let full_len = body.len() as u64;
                        let body = if suppress { Bytes::new() } else { body };
                        let block =
                            self.encode_response_headers(&meta, status, Some(full_len));
                        frame::write_headers(&mut self.out, stream_id, &block, body.is_empty());
                        let stream = self.table.get_mut(stream_id).expect("present");
                        stream.response_headers_sent = true;
                        if body.is_empty() {
                            Self::mark_response_ended(stream);
                        } else {
                            stream.pending_out.push_back(body);
                            stream.pending_end = Some(HeaderMap::new());
                        }
                        stream.exchange.transition(ExchangeState::ResponseHeadersSent);
                    }
                    BodyPlan::Empty => {
                        let block = self.encode_response_headers(&meta, status, None);
                        frame::write_headers(&mut self.out, stream_id, &block, true);
                        let stream = self.table.get_mut(stream_id).expect("present");
                        stream.response_headers_sent = true;
                        Self::mark_response_ended(stream);
                        stream.exchange.transition(ExchangeState::ResponseHeadersSent);
                    }
                    BodyPlan::Stream => {
                        let block = self.encode_response_headers(&meta, status, None);
                        frame::write_headers(&mut self.out, stream_id, &block, false);
                        let stream = self.table.get_mut(stream_id).expect("present");
                        stream.response_headers_sent = true;
                        if suppress {
                            // Later chunks become no-ops at the socket.
                            stream.head_request = true;
                        }
                        stream.exchange.transition(ExchangeState::ResponseHeadersSent);
                    }
                }
            }
            WriteOp::Chunk(data) => {
                let stream = self.table.get_mut(stream_id).expect("present");
                if !data.is_empty() && !stream.head_request {
                    stream.pending_out.push_back(data);
                }
                stream
                    .exchange
                    .transition(ExchangeState::ResponseBodyStreaming);
            }
            WriteOp::End { trailers } => {
                let stream = self.table.get_mut(stream_id).expect("present");
                stream.pending_end = Some(trailers);
            }
            WriteOp::Abort => {
                self.reset_stream(stream_id, ErrorCode::Internal);
                return Ok(());
            }
        }
        self.flush_stream_output(stream_id);
        Ok(())
    }

    /// Writes as much pending stream output as both windows allow, splitting
    /// DATA frames to fit. A zero-window stream simply keeps its queue; other
    /// streams are unaffected.
    fn flush_stream_output(&mut self, stream_id: u32) {
        let peer_max_frame = self.peer_max_frame as usize;
        let mut conn_send = self.conn_send;
        {
            let Some(stream) = self.table.get_mut(stream_id) else {
                return;
            };
            if !stream.response_headers_sent {
                return;
            }
            while let Some(front) = stream.pending_out.front_mut() {
                let allowed = front
                    .len()
                    .min(stream.send_window.available() as usize)
                    .min(conn_send.available() as usize)
                    .min(peer_max_frame);
                if allowed == 0 {
                    self.conn_send = conn_send;
                    return;
                }
                let slice = front.split_to(allowed);
                if front.is_empty() {
                    stream.pending_out.pop_front();
                }
                stream.send_window.consume(slice.len() as u32).ok();
                conn_send.consume(slice.len() as u32).ok();
                frame::write_data(&mut self.out, stream_id, &slice, false);
            }
        }
        self.conn_send = conn_send;

        let trailers = {
            let Some(stream) = self.table.get_mut(stream_id) else {
                return;
            };
            if !stream.pending_out.is_empty() || stream.response_ended {
                return;
            }
            match stream.pending_end.take() {
                Some(trailers) => trailers,
                None => return,
            }
        };
        let allow = self
            .table
            .get_mut(stream_id)
            .map(|s| s.allow_trailers)
            .unwrap_or(false);
        if allow && !trailers.is_empty() {
            let fields: Vec<(Vec<u8>, Vec<u8>)> = trailers
                .iter()
                .map(|(n, v)| (n.as_str().as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect();
            let mut block = Vec::new();
            self.encoder.encode(
                fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
                &mut block,
            );
            frame::write_headers(&mut self.out, stream_id, &block, true);
        } else {
            if !trailers.is_empty() {
                tracing::debug!(
                    stream_id,
                    "dropping response trailers: client did not send TE: trailers"
                );
            }
            frame::write_data(&mut self.out, stream_id, &[], true);
        }
        if let Some(stream) = self.table.get_mut(stream_id) {
            Self::mark_response_ended(stream);
        }
    }

    fn mark_response_ended(stream: &mut StreamEntry) {
        stream.response_ended = true;
        stream.state = match stream.state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    fn encode_response_headers(
        &mut self,
        meta: &ResponseMeta,
        status: StatusCode,
        body_len: Option<u64>,
    ) -> Vec<u8> {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(meta.headers.len() + 3);
        fields.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
        let mut saw_date = false;
        let mut saw_content_length = false;
        for (name, value) in &meta.headers {
            // Connection-specific fields must not cross into h2.
            if name == header::CONNECTION
                || name == header::TRANSFER_ENCODING
                || name == header::UPGRADE
                || name == header::TE
            {
                continue;
            }
            if name == header::CONTENT_LENGTH && status_forbids_body(status) {
                continue;
            }
            saw_date |= name == header::DATE;
            saw_content_length |= name == header::CONTENT_LENGTH;
            fields.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        if !saw_date {
            fields.push((
                b"date".to_vec(),
                crate::http::date::http_date_value().as_bytes().to_vec(),
            ));
        }
        if !saw_content_length && !status_forbids_body(status) {
            if let Some(len) = body_len {
                fields.push((b"content-length".to_vec(), len.to_string().into_bytes()));
            }
        }
        let mut block = Vec::new();
        self.encoder.encode(
            fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
            &mut block,
        );
        block
    }

    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        frame::write_rst_stream(&mut self.out, stream_id, code);
        if let Some(stream) = self.table.get_mut(stream_id) {
            stream.state = StreamState::Closed;
            if let Some(tx) = stream.body_tx.take() {
                let _ = tx.try_send(BodyEvent::Error(BodyError::Disconnected));
            }
            stream.exchange.cancel.cancel();
            let terminal = if code == ErrorCode::Internal {
                ExchangeState::Errored
            } else {
                ExchangeState::ClientDisconnected
            };
            stream.exchange.transition(terminal);
        }
    }

    /// Responds with a server-generated error page on a stream the handler
    /// chain never sees. `client_done` marks the request side already closed.
    fn respond_canned(&mut self, stream_id: u32, error: &StatusError, client_done: bool) {
        let (meta, body) = crate::catcher::html_response(error, Version::HTTP_2);
        let block = self.encode_response_headers(&meta, error.code, Some(body.len() as u64));
        frame::write_headers(&mut self.out, stream_id, &block, body.is_empty());
        if !body.is_empty() {
            frame::write_data(&mut self.out, stream_id, &body, true);
        }
        if !client_done {
            frame::write_rst_stream(&mut self.out, stream_id, ErrorCode::NoError);
        }
    }

    fn process_headers(
        &mut self,
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let decoded = self.decoder.decode(&fragment).map_err(|error| {
            tracing::debug!(%error, "hpack decoding failed");
            H2Error {
                code: ErrorCode::Compression,
                reason: "hpack decoding failed",
            }
        })?;

        // Trailer block for an existing stream.
        if let Some(state) = self.table.get_mut(stream_id).map(|s| s.state) {
            if state == StreamState::Closed {
                return Ok(());
            }
            if !end_stream {
                return Err(H2Error::protocol("trailers without END_STREAM"));
            }
            let mut trailers = HeaderMap::new();
            for (name, value) in decoded.fields {
                if name.starts_with(b":") {
                    return Err(H2Error::protocol("pseudo-header in trailers"));
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(&name),
                    HeaderValue::from_bytes(&value),
                ) {
                    trailers.append(name, value);
                }
            }
            let stream = self.table.get_mut(stream_id).expect("present");
            stream.inbound.push_back(BodyEvent::Trailers(trailers));
            stream.state = match stream.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
            stream.exchange.transition(ExchangeState::RequestComplete);
            stream.flush_inbound();
            self.update_body_fuse();
            return Ok(());
        }

        if stream_id % 2 == 0 || stream_id <= self.table.highest_seen {
            return Err(H2Error::protocol("invalid client stream id"));
        }
        self.table.highest_seen = stream_id;
        if self.draining {
            frame::write_rst_stream(&mut self.out, stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }
        if self.table.len() >= self.ctx.conf.max_concurrent_streams as usize {
            self.ctx.stats.rejected_overload();
            frame::write_rst_stream(&mut self.out, stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }
        self.table.last_processed = stream_id;
        if decoded.overflowed {
            self.ctx.stats.invalid_request();
            self.respond_canned(
                stream_id,
                &StatusError::request_header_fields_too_large(),
                end_stream,
            );
            return Ok(());
        }

        match self.build_request_parts(decoded.fields, end_stream) {
            Ok(parts) => self.start_stream(stream_id, parts, end_stream),
            Err(reject) => {
                self.ctx.stats.invalid_request();
                self.respond_canned(stream_id, &reject, end_stream);
            }
        }
        Ok(())
    }

    fn build_request_parts(
        &self,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<Box<RequestParts>, StatusError> {
        let mut method: Option<Vec<u8>> = None;
        let mut path: Option<Vec<u8>> = None;
        let mut scheme: Option<Vec<u8>> = None;
        let mut authority: Option<Vec<u8>> = None;
        let mut headers = HeaderMap::new();
        let mut saw_regular = false;
        for (name, value) in fields {
            if let Some(pseudo) = name.strip_prefix(b":") {
                if saw_regular {
                    return Err(
                        StatusError::bad_request().detail("pseudo-header after regular header")
                    );
                }
                let slot = match pseudo {
                    b"method" => &mut method,
                    b"path" => &mut path,
                    b"scheme" => &mut scheme,
                    b"authority" => &mut authority,
                    _ => return Err(StatusError::bad_request().detail("unknown pseudo-header")),
                };
                if slot.replace(value).is_some() {
                    return Err(StatusError::bad_request().detail("duplicate pseudo-header"));
                }
            } else {
                saw_regular = true;
                match (
                    HeaderName::from_bytes(&name),
                    HeaderValue::from_bytes(&value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.append(name, value);
                    }
                    _ => return Err(StatusError::bad_request().detail("invalid header field")),
                }
            }
        }
        let method_bytes =
            method.ok_or_else(|| StatusError::bad_request().detail("missing :method"))?;
        let raw_path = path.ok_or_else(|| StatusError::bad_request().detail("missing :path"))?;
        scheme.ok_or_else(|| StatusError::bad_request().detail("missing :scheme"))?;
        if let Some(authority) = authority {
            if let Ok(value) = HeaderValue::from_bytes(&authority) {
                headers.entry(header::HOST).or_insert(value);
            }
        }

        let method = Method::from_bytes(&method_bytes)
            .map_err(|_| StatusError::bad_request().detail("invalid :method"))?;
        const METHODS: &[&[u8]] = &[
            b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"OPTIONS", b"PATCH", b"CONNECT",
            b"TRACE",
        ];
        if !METHODS.contains(&method_bytes.as_slice()) {
            return Err(StatusError::method_not_allowed());
        }
        if raw_path.len() > self.ctx.conf.max_url_size {
            return Err(StatusError::uri_too_long());
        }
        let raw_path = String::from_utf8(raw_path)
            .map_err(|_| StatusError::bad_request().detail("non-utf8 :path"))?;
        let (path, raw_query) = match raw_path.split_once('?') {
            Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
            None => (raw_path, None),
        };

        let body_mode = if end_stream {
            BodyMode::None
        } else {
            match crate::http::header_str(&headers, header::CONTENT_LENGTH)
                .and_then(|v| v.trim().parse::<u64>().ok())
            {
                Some(n) => BodyMode::Fixed(n),
                None => BodyMode::Chunked,
            }
        };
        if let BodyMode::Fixed(n) = body_mode {
            if n > self.ctx.conf.max_request_size {
                return Err(StatusError::payload_too_large());
            }
        }

        Ok(Box::new(RequestParts {
            method,
            path,
            raw_query,
            version: Version::HTTP_2,
            headers,
            body_mode,
            scheme: Scheme::HTTPS,
        }))
    }

    fn start_stream(&mut self, stream_id: u32, parts: Box<RequestParts>, end_stream: bool) {
        let (ops_tx, ops_rx) = ops_channel();
        let (credit_tx, credit_rx) = mpsc::unbounded_channel();
        let exchange = ExchangeCtx::new(Version::HTTP_2, ops_tx, self.ctx.force.child_token());
        let (body_tx, body) = if end_stream {
            (None, ReqBody::none())
        } else {
            let (tx, rx) = body_channel();
            (Some(tx), ReqBody::stream(rx, Some(credit_tx)))
        };

        let permit = match &self.ctx.app_gate {
            Some(gate) => match Arc::clone(gate).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.ctx.stats.rejected_overload();
                    self.respond_canned(stream_id, &StatusError::service_unavailable(), end_stream);
                    return;
                }
            },
            None => None,
        };

        let allow_trailers =
            crate::http::header_contains_token(&parts.headers, header::TE, "trailers");
        let head_request = parts.method == Method::HEAD;
        let req = Request::assemble(
            *parts,
            body,
            Arc::clone(&exchange),
            self.ctx.remote_addr,
            self.ctx.local_addr,
            self.ctx.conf.max_request_size,
        );
        let res = Response::new(Arc::clone(&exchange));
        if end_stream {
            exchange.transition(ExchangeState::RequestComplete);
        }

        self.ctx.stats.request_started();
        self.ctx
            .monitor
            .active_requests
            .fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.ctx.stats);
        let monitor = Arc::clone(&self.ctx.monitor);
        exchange.on_complete(Box::new(move |state| {
            let completed = state == ExchangeState::Complete;
            stats.request_ended(completed);
            monitor.active_requests.fetch_sub(1, Ordering::Relaxed);
            if completed {
                monitor.completed_requests.fetch_add(1, Ordering::Relaxed);
            }
        }));

        self.table.insert(StreamEntry {
            id: stream_id,
            state: if end_stream {
                StreamState::HalfClosedRemote
            } else {
                StreamState::Open
            },
            exchange: Arc::clone(&exchange),
            ops_rx,
            credit_rx,
            inbound: VecDeque::new(),
            body_tx,
            recv_window: FlowWindow::new(frame::DEFAULT_INITIAL_WINDOW),
            send_window: FlowWindow::new(self.peer_initial_window),
            pending_out: VecDeque::new(),
            pending_end: None,
            response_headers_sent: false,
            response_ended: false,
            allow_trailers,
            head_request,
            body_bytes_seen: 0,
        });
        self.update_body_fuse();

        let chain = Arc::clone(&self.ctx.chain);
        tokio::spawn(run_stream_exchange(chain, exchange, req, res, permit));
    }

    /// The request-read deadline is armed while any stream still expects
    /// body bytes.
    fn update_body_fuse(&mut self) {
        let awaiting = self
            .table
            .iter_mut()
            .any(|s| matches!(s.state, StreamState::Open | StreamState::HalfClosedLocal));
        if awaiting {
            self.fuse.event(FuseEvent::AwaitingBody);
        } else {
            self.fuse.event(FuseEvent::BodyProgress);
        }
    }

    fn reap_streams(&mut self) {
        for mut stream in self.table.purge_closed() {
            // Refund any flow credit the consumer released after the stream
            // closed, so the connection window stays whole.
            while let Ok(credit) = stream.credit_rx.try_recv() {
                if self.conn_recv.expand(credit).is_ok() {
                    frame::write_window_update(&mut self.out, 0, credit);
                }
            }
            stream.exchange.transition(ExchangeState::Complete);
        }
        self.update_body_fuse();
    }

    fn close_all_streams(&mut self, state: ExchangeState) {
        for stream in self.table.iter_mut() {
            if let Some(tx) = stream.body_tx.take() {
                let _ = tx.try_send(BodyEvent::Error(BodyError::Disconnected));
            }
            stream.exchange.cancel.cancel();
            stream.exchange.transition(state);
        }
    }
}

/// Runs one stream's handler chain and completion protocol.
async fn run_stream_exchange(
    chain: Arc<HandlerChain>,
    exchange: Arc<ExchangeCtx>,
    mut req: Request,
    mut res: Response,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
) {
    let outcome = chain.dispatch(&mut req, &mut res).await;
    match outcome {
        Ok(Outcome::Handled) => {
            if exchange.is_async() {
                exchange.wait_async_done().await;
                if let Some(error) = exchange.take_async_error() {
                    if res.is_started() || !chain.render_error(&error, &mut res) {
                        exchange.abort().await;
                        exchange.transition(ExchangeState::Errored);
                        return;
                    }
                }
            }
            let _ = exchange.finalize_emit(res.take_staged()).await;
        }
        Ok(Outcome::NotHandled) => {
            let error = StatusError::not_found();
            let _ = res.status_code(error.code);
            res.html(crate::catcher::error_page(&error));
            let _ = exchange.finalize_emit(res.take_staged()).await;
        }
        Err(error) => {
            if res.is_started() || !chain.render_error(&error, &mut res) {
                tracing::error!(%error, "stream handler failed");
                exchange.abort().await;
                exchange.transition(ExchangeState::Errored);
                return;
            }
            let _ = exchange.finalize_emit(res.take_staged()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::conf::ServerConfig;
    use crate::handler::handler_fn;
    use crate::proto::test_conn_ctx;
    use crate::Result;

    struct H2Client {
        io: DuplexStream,
        cursor: ByteCursor,
        decoder: hpack::Decoder,
        encoder: hpack::Encoder,
    }

    impl H2Client {
        async fn connect(chain: HandlerChain, conf: ServerConfig) -> (Self, Arc<crate::stats::ServerStats>) {
            let (client, server) = tokio::io::duplex(1 << 20);
            let ctx = test_conn_ctx(chain, conf);
            let stats = Arc::clone(&ctx.stats);
            tokio::spawn(serve_connection(server, ctx));
            let mut client = Self {
                io: client,
                cursor: ByteCursor::with_capacity(DEFAULT_BUFFER_SIZE, 1 << 22),
                decoder: hpack::Decoder::new(4096, 1 << 20),
                encoder: hpack::Encoder::new(),
            };
            client.io.write_all(frame::CONNECTION_PREFACE).await.expect("preface");
            (client, stats)
        }

        async fn send_settings(&mut self, settings: &Settings) {
            let mut out = BytesMut::new();
            frame::write_settings(&mut out, settings);
            self.io.write_all(&out).await.expect("settings");
        }

        async fn send_request(&mut self, stream_id: u32, path: &str, extra: &[(&str, &str)]) {
            let mut fields: Vec<(Vec<u8>, Vec<u8>)> = vec![
                (b":method".to_vec(), b"GET".to_vec()),
                (b":scheme".to_vec(), b"https".to_vec()),
                (b":path".to_vec(), path.as_bytes().to_vec()),
            ];
            for (name, value) in extra {
                fields.push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
            }
            let mut block = Vec::new();
            self.encoder.encode(
                fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())),
                &mut block,
            );
            let mut out = BytesMut::new();
            frame::write_headers(&mut out, stream_id, &block, true);
            self.io.write_all(&out).await.expect("headers");
        }

        async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
            let mut out = BytesMut::new();
            frame::write_window_update(&mut out, stream_id, increment);
            self.io.write_all(&out).await.expect("window update");
        }

        async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) =
                    frame::read_frame(&mut self.cursor, frame::DEFAULT_MAX_FRAME_SIZE)
                        .expect("well-formed frame")
                {
                    return frame;
                }
                assert!(self.cursor.reserve(DEFAULT_BUFFER_SIZE));
                let n = self
                    .io
                    .read_buf(self.cursor.writable())
                    .await
                    .expect("read");
                assert!(n > 0, "server closed unexpectedly");
            }
        }

        /// Skips connection housekeeping frames.
        async fn next_stream_frame(&mut self) -> Frame {
            loop {
                match self.next_frame().await {
                    Frame::Settings { .. } | Frame::Ping { .. } | Frame::WindowUpdate { .. } => {}
                    frame => return frame,
                }
            }
        }

        fn decode_headers(&mut self, fragment: &Bytes) -> Vec<(String, String)> {
            self.decoder
                .decode(fragment)
                .expect("decodable headers")
                .fields
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8_lossy(&n).into_owned(),
                        String::from_utf8_lossy(&v).into_owned(),
                    )
                })
                .collect()
        }
    }

    fn hello<'a>(
        _req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            res.write("Hello 0").await?;
            Ok(Outcome::Handled)
        })
    }

    fn payload<'a>(
        _req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            res.write(vec![b'x'; 100]).await?;
            Ok(Outcome::Handled)
        })
    }

    #[tokio::test]
    async fn test_simple_get() {
        let chain = HandlerChain::new().push(handler_fn(hello));
        let (mut client, _stats) = H2Client::connect(chain, ServerConfig::new()).await;
        client.send_settings(&Settings::default()).await;
        client.send_request(1, "/blah", &[]).await;

        let frame = client.next_stream_frame().await;
        let Frame::Headers { stream_id, fragment, end_stream, .. } = frame else {
            panic!("expected response headers, got {frame:?}");
        };
        assert_eq!(stream_id, 1);
        assert!(!end_stream);
        let headers = client.decode_headers(&fragment);
        assert_eq!(headers[0], (":status".to_owned(), "200".to_owned()));
        assert!(headers
            .iter()
            .any(|(n, v)| n == "content-length" && v == "7"));
        assert!(headers.iter().any(|(n, _)| n == "date"));

        let mut body = Vec::new();
        loop {
            match client.next_stream_frame().await {
                Frame::Data { data, end_stream, .. } => {
                    body.extend_from_slice(&data);
                    if end_stream {
                        break;
                    }
                }
                frame => panic!("expected data, got {frame:?}"),
            }
        }
        assert_eq!(&body[..], b"Hello 0");
    }

    #[tokio::test]
    async fn test_flow_control_one_slow_stream_does_not_block_another() {
        let chain = HandlerChain::new().push(handler_fn(payload));
        let (mut client, _stats) = H2Client::connect(chain, ServerConfig::new()).await;
        // Tiny per-stream windows: every response stalls after 8 bytes.
        client
            .send_settings(&Settings {
                initial_window_size: Some(8),
                ..Settings::default()
            })
            .await;
        // Wait for the settings ack so the streams are created under the
        // small window.
        loop {
            if let Frame::Settings { ack: true, .. } = client.next_frame().await {
                break;
            }
        }
        client.send_request(1, "/a", &[]).await;
        client.send_request(3, "/b", &[]).await;

        let mut sent: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
        let mut headers_seen = 0;
        while headers_seen < 2 || sent.values().sum::<usize>() < 16 {
            match client.next_stream_frame().await {
                Frame::Headers { .. } => headers_seen += 1,
                Frame::Data { stream_id, data, .. } => {
                    *sent.entry(stream_id).or_default() += data.len();
                }
                frame => panic!("unexpected frame: {frame:?}"),
            }
        }
        assert_eq!(sent.get(&1), Some(&8), "stream 1 limited by its window");
        assert_eq!(sent.get(&3), Some(&8), "stream 3 limited by its window");

        // Open stream 3's window only: it must finish while stream 1 stays
        // stalled.
        client.send_window_update(3, 1_000).await;
        let mut got_3 = 8;
        loop {
            match client.next_stream_frame().await {
                Frame::Data { stream_id, data, end_stream, .. } => {
                    assert_eq!(stream_id, 3, "stream 1 has no window; only 3 may send");
                    got_3 += data.len();
                    if end_stream {
                        break;
                    }
                }
                frame => panic!("unexpected frame: {frame:?}"),
            }
        }
        assert_eq!(got_3, 100);

        // Now release stream 1.
        client.send_window_update(1, 1_000).await;
        let mut got_1 = 8;
        loop {
            match client.next_stream_frame().await {
                Frame::Data { stream_id, data, end_stream, .. } => {
                    assert_eq!(stream_id, 1);
                    got_1 += data.len();
                    if end_stream {
                        break;
                    }
                }
                frame => panic!("unexpected frame: {frame:?}"),
            }
        }
        assert_eq!(got_1, 100);
    }

    #[tokio::test]
    async fn test_stream_table_full_refuses_stream() {
        fn slow<'a>(
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFuture<'a, Result<Outcome>> {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                res.write("done").await?;
                Ok(Outcome::Handled)
            })
        }
        let chain = HandlerChain::new().push(handler_fn(slow));
        let conf = ServerConfig::new().max_concurrent_streams(1);
        let (mut client, stats) = H2Client::connect(chain, conf).await;
        client.send_settings(&Settings::default()).await;
        client.send_request(1, "/a", &[]).await;
        client.send_request(3, "/b", &[]).await;

        loop {
            match client.next_stream_frame().await {
                Frame::Reset { stream_id, code } => {
                    assert_eq!(stream_id, 3);
                    assert_eq!(code, ErrorCode::RefusedStream);
                    break;
                }
                Frame::Headers { stream_id, .. } | Frame::Data { stream_id, .. } => {
                    assert_eq!(stream_id, 1);
                }
                frame => panic!("unexpected frame: {frame:?}"),
            }
        }
        assert_eq!(stats.snapshot().rejected_due_to_overload, 1);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let chain = HandlerChain::new();
        let (mut client, _stats) = H2Client::connect(chain, ServerConfig::new()).await;
        client.send_settings(&Settings::default()).await;
        let mut out = BytesMut::new();
        // A PING without the ack flag, payload echoed back.
        out.extend_from_slice(&[0, 0, 8, 0x6, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        client.io.write_all(&out).await.expect("ping");
        loop {
            if let Frame::Ping { ack: true, payload } = client.next_frame().await {
                assert_eq!(payload, [1, 2, 3, 4, 5, 6, 7, 8]);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_response_trailers_when_negotiated() {
        fn chunky<'a>(
            _req: &'a mut Request,
            res: &'a mut Response,
        ) -> BoxFuture<'a, Result<Outcome>> {
            Box::pin(async move {
                res.set_trailer(
                    header::HeaderName::from_static("server-timing"),
                    HeaderValue::from_static("total;dur=123.4"),
                );
                res.send_chunk("Hello").await?;
                res.send_chunk(" world").await?;
                Ok(Outcome::Handled)
            })
        }
        let chain = HandlerChain::new().push(handler_fn(chunky));
        let (mut client, _stats) = H2Client::connect(chain, ServerConfig::new()).await;
        client.send_settings(&Settings::default()).await;
        client.send_request(1, "/", &[("te", "trailers")]).await;

        let frame = client.next_stream_frame().await;
        assert!(matches!(frame, Frame::Headers { end_stream: false, .. }));
        let mut body = Vec::new();
        let trailers = loop {
            match client.next_stream_frame().await {
                Frame::Data { data, end_stream, .. } => {
                    assert!(!end_stream, "trailers must close the stream");
                    body.extend_from_slice(&data);
                }
                Frame::Headers { fragment, end_stream, .. } => {
                    assert!(end_stream);
                    break client.decode_headers(&fragment);
                }
                frame => panic!("unexpected frame: {frame:?}"),
            }
        };
        assert_eq!(&body[..], b"Hello world");
        assert_eq!(
            trailers,
            vec![("server-timing".to_owned(), "total;dur=123.4".to_owned())]
        );
    }
}
