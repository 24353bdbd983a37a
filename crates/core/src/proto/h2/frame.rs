//! HTTP/2 frame codec (RFC 7540 §4, §6).

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::ByteCursor;

pub(crate) const FRAME_HEADER_LEN: usize = 9;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
pub(crate) const DEFAULT_INITIAL_WINDOW: u32 = 65_535;
pub(crate) const MAX_WINDOW: u32 = (1 << 31) - 1;
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

const KIND_DATA: u8 = 0x0;
const KIND_HEADERS: u8 = 0x1;
const KIND_PRIORITY: u8 = 0x2;
const KIND_RST_STREAM: u8 = 0x3;
const KIND_SETTINGS: u8 = 0x4;
const KIND_PUSH_PROMISE: u8 = 0x5;
const KIND_PING: u8 = 0x6;
const KIND_GOAWAY: u8 = 0x7;
const KIND_WINDOW_UPDATE: u8 = 0x8;
const KIND_CONTINUATION: u8 = 0x9;

/// RFC 7540 §7 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub(crate) fn from_u32(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::Compression,
            0xa => Self::Connect,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::Protocol,
        }
    }
}

/// A connection-fatal protocol violation, answered with GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct H2Error {
    pub(crate) code: ErrorCode,
    pub(crate) reason: &'static str,
}

impl H2Error {
    pub(crate) fn protocol(reason: &'static str) -> Self {
        Self {
            code: ErrorCode::Protocol,
            reason,
        }
    }

    pub(crate) fn frame_size(reason: &'static str) -> Self {
        Self {
            code: ErrorCode::FrameSize,
            reason,
        }
    }
}

/// Peer settings the server acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

const SETTING_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTING_ENABLE_PUSH: u16 = 0x2;
const SETTING_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTING_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTING_MAX_FRAME_SIZE: u16 = 0x5;
const SETTING_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    fn decode(payload: &[u8]) -> Result<Self, H2Error> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::frame_size("settings length not a multiple of 6"));
        }
        let mut settings = Self::default();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                SETTING_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTING_ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::protocol("invalid ENABLE_PUSH value"));
                    }
                    settings.enable_push = Some(value);
                }
                SETTING_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value);
                }
                SETTING_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW {
                        return Err(H2Error {
                            code: ErrorCode::FlowControl,
                            reason: "INITIAL_WINDOW_SIZE beyond 2^31-1",
                        });
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTING_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTING_MAX_HEADER_LIST_SIZE => {
                    settings.max_header_list_size = Some(value);
                }
                _ => {}
            }
        }
        Ok(settings)
    }

    fn encode(&self, out: &mut BytesMut) {
        let mut put = |id: u16, value: Option<u32>| {
            if let Some(value) = value {
                out.put_u16(id);
                out.put_u32(value);
            }
        };
        put(SETTING_HEADER_TABLE_SIZE, self.header_table_size);
        put(SETTING_ENABLE_PUSH, self.enable_push);
        put(SETTING_MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        put(SETTING_INITIAL_WINDOW_SIZE, self.initial_window_size);
        put(SETTING_MAX_FRAME_SIZE, self.max_frame_size);
        put(SETTING_MAX_HEADER_LIST_SIZE, self.max_header_list_size);
    }

    fn encoded_len(&self) -> usize {
        [
            self.header_table_size,
            self.enable_push,
            self.max_concurrent_streams,
            self.initial_window_size,
            self.max_frame_size,
            self.max_header_list_size,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
            * 6
    }
}

/// One decoded frame.
#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload plus padding, the amount charged to flow windows.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
        end_stream: bool,
    },
    Priority {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    Unknown {
        stream_id: u32,
    },
}

fn strip_padding(payload: &mut Bytes, flags: u8) -> Result<(), H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(());
    }
    if payload.is_empty() {
        return Err(H2Error::protocol("padded frame without pad length"));
    }
    let pad_len = payload[0] as usize;
    let _ = payload.split_to(1);
    if pad_len >= payload.len() + 1 {
        return Err(H2Error::protocol("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

/// Decodes the next complete frame, or returns `None` when more bytes are
/// needed.
pub(crate) fn read_frame(
    cur: &mut ByteCursor,
    max_frame_size: u32,
) -> Result<Option<Frame>, H2Error> {
    let Some(head) = cur.peek_at(FRAME_HEADER_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let kind = head[3];
    let flags = head[4];
    let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;
    if len > max_frame_size as usize {
        return Err(H2Error::frame_size("frame exceeds SETTINGS_MAX_FRAME_SIZE"));
    }
    if cur.remaining() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    cur.skip(FRAME_HEADER_LEN);
    let mut payload = cur.take_bytes(len);

    let frame = match kind {
        KIND_DATA => {
            if stream_id == 0 {
                return Err(H2Error::protocol("DATA on stream 0"));
            }
            let flow_len = payload.len() as u32;
            strip_padding(&mut payload, flags)?;
            Frame::Data {
                stream_id,
                data: payload,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_len,
            }
        }
        KIND_HEADERS => {
            if stream_id == 0 {
                return Err(H2Error::protocol("HEADERS on stream 0"));
            }
            strip_padding(&mut payload, flags)?;
            if flags & FLAG_PRIORITY != 0 {
                if payload.len() < 5 {
                    return Err(H2Error::frame_size("HEADERS too short for priority"));
                }
                let _ = payload.split_to(5);
            }
            Frame::Headers {
                stream_id,
                fragment: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        KIND_PRIORITY => {
            if payload.len() != 5 {
                return Err(H2Error::frame_size("PRIORITY payload must be 5 bytes"));
            }
            Frame::Priority { stream_id }
        }
        KIND_RST_STREAM => {
            if stream_id == 0 {
                return Err(H2Error::protocol("RST_STREAM on stream 0"));
            }
            if payload.len() != 4 {
                return Err(H2Error::frame_size("RST_STREAM payload must be 4 bytes"));
            }
            let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Frame::Reset {
                stream_id,
                code: ErrorCode::from_u32(code),
            }
        }
        KIND_SETTINGS => {
            if stream_id != 0 {
                return Err(H2Error::protocol("SETTINGS on a stream"));
            }
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::frame_size("SETTINGS ack with payload"));
            }
            Frame::Settings {
                ack,
                settings: Settings::decode(&payload)?,
            }
        }
        KIND_PUSH_PROMISE => Frame::PushPromise { stream_id },
        KIND_PING => {
            if stream_id != 0 {
                return Err(H2Error::protocol("PING on a stream"));
            }
            if payload.len() != 8 {
                return Err(H2Error::frame_size("PING payload must be 8 bytes"));
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        KIND_GOAWAY => {
            if payload.len() < 8 {
                return Err(H2Error::frame_size("GOAWAY payload too short"));
            }
            let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                & 0x7fff_ffff;
            let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Frame::GoAway {
                last_stream_id: last,
                code: ErrorCode::from_u32(code),
            }
        }
        KIND_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::frame_size("WINDOW_UPDATE payload must be 4 bytes"));
            }
            let increment =
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff;
            if increment == 0 {
                return Err(H2Error::protocol("WINDOW_UPDATE with zero increment"));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        KIND_CONTINUATION => {
            if stream_id == 0 {
                return Err(H2Error::protocol("CONTINUATION on stream 0"));
            }
            Frame::Continuation {
                stream_id,
                fragment: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        _ => Frame::Unknown { stream_id },
    };
    Ok(Some(frame))
}

fn put_frame_header(out: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: u32) {
    debug_assert!(len <= MAX_ALLOWED_FRAME_SIZE as usize);
    let len = (len as u32).to_be_bytes();
    out.put_slice(&len[1..]);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(stream_id & 0x7fff_ffff);
}

pub(crate) fn write_data(out: &mut BytesMut, stream_id: u32, data: &[u8], end_stream: bool) {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    put_frame_header(out, data.len(), KIND_DATA, flags, stream_id);
    out.put_slice(data);
}

pub(crate) fn write_headers(
    out: &mut BytesMut,
    stream_id: u32,
    fragment: &[u8],
    end_stream: bool,
) {
    let mut flags = FLAG_END_HEADERS;
    if end_stream {
        flags |= FLAG_END_STREAM;
    }
    put_frame_header(out, fragment.len(), KIND_HEADERS, flags, stream_id);
    out.put_slice(fragment);
}

pub(crate) fn write_settings(out: &mut BytesMut, settings: &Settings) {
    put_frame_header(out, settings.encoded_len(), KIND_SETTINGS, 0, 0);
    settings.encode(out);
}

pub(crate) fn write_settings_ack(out: &mut BytesMut) {
    put_frame_header(out, 0, KIND_SETTINGS, FLAG_ACK, 0);
}

pub(crate) fn write_ping_ack(out: &mut BytesMut, payload: [u8; 8]) {
    put_frame_header(out, 8, KIND_PING, FLAG_ACK, 0);
    out.put_slice(&payload);
}

pub(crate) fn write_rst_stream(out: &mut BytesMut, stream_id: u32, code: ErrorCode) {
    put_frame_header(out, 4, KIND_RST_STREAM, 0, stream_id);
    out.put_u32(code as u32);
}

pub(crate) fn write_goaway(out: &mut BytesMut, last_stream_id: u32, code: ErrorCode) {
    put_frame_header(out, 8, KIND_GOAWAY, 0, 0);
    out.put_u32(last_stream_id & 0x7fff_ffff);
    out.put_u32(code as u32);
}

pub(crate) fn write_window_update(out: &mut BytesMut, stream_id: u32, increment: u32) {
    put_frame_header(out, 4, KIND_WINDOW_UPDATE, 0, stream_id);
    out.put_u32(increment & 0x7fff_ffff);
}
