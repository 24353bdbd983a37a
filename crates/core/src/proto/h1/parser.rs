//! Incremental HTTP/1.1 message parser.
//!
//! A byte-at-a-time state machine fed from a [`ByteCursor`]. It never blocks:
//! [`MessageParser::poll_event`] returns `None` when more bytes are needed,
//! and body payloads are handed out as zero-copy slices of the read buffer.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::buffer::ByteCursor;
use crate::http::body::BodyMode;
use crate::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use crate::proto::{ParseError, ParseResult};

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseState {
    ReqStart,
    Method,
    Target,
    Version,
    ReqLineEnd,
    RespStart,
    Status,
    Reason,
    StatusLineEnd,
    HeaderStart,
    HeaderName,
    HeaderNameEnd,
    HeaderValue,
    HeaderValueEnd,
    HeadersEnd,
    FixedBody,
    UnspecifiedBody,
    ChunkStart,
    ChunkSize,
    ChunkExts,
    ChunkHeaderEnd,
    ChunkData,
    ChunkDataRead,
    ChunkDataEnd,
    LastChunk,
    ChunkedBodyEnd,
    Trailers,
    WebsocketHandoff,
}

/// Which side of the wire this parser reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Request,
    Response,
}

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) raw_query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
    /// 405, 414 or 431 recorded while parsing; the message is still consumed.
    pub(crate) rejected: Option<StatusCode>,
    /// Authority-form target without a scheme: answer with 301 to this path.
    pub(crate) redirect: Option<String>,
    pub(crate) expects_continue: bool,
    pub(crate) connection_close: bool,
    pub(crate) is_upgrade: bool,
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body_mode: BodyMode,
}

/// One unit of parser output.
#[derive(Debug)]
pub(crate) enum ParseEvent {
    Request(Box<RequestHead>),
    Response(Box<ResponseHead>),
    BodyChunk { data: Bytes, last: bool },
    EndOfBody,
    Trailers(HeaderMap),
    Eof,
}

/// Size limits the parser enforces.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParserLimits {
    pub(crate) max_url_size: usize,
    pub(crate) max_headers_size: usize,
    pub(crate) max_body_size: u64,
}

const METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
        | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

fn is_value_byte(b: u8) -> bool {
    b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80
}

/// Decodes the four unreserved percent escapes, preserving every other
/// escape untouched.
fn canonicalize_path(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            let pair = [raw[i + 1].to_ascii_uppercase(), raw[i + 2].to_ascii_uppercase()];
            let decoded = match &pair {
                b"7E" => Some('~'),
                b"5F" => Some('_'),
                b"2E" => Some('.'),
                b"2D" => Some('-'),
                _ => None,
            };
            if let Some(c) = decoded {
                out.push(c);
                i += 3;
                continue;
            }
        }
        out.push(raw[i] as char);
        i += 1;
    }
    out
}

pub(crate) struct MessageParser {
    kind: MessageKind,
    state: ParseState,
    limits: ParserLimits,
    pending: VecDeque<ParseEvent>,

    method_buf: Vec<u8>,
    target_buf: Vec<u8>,
    target_len: usize,
    version_buf: Vec<u8>,
    status_digits: Vec<u8>,

    name_buf: Vec<u8>,
    value_buf: Vec<u8>,
    headers: HeaderMap,
    header_bytes: usize,
    headers_over: bool,
    in_trailers: bool,
    trailer_line: Vec<u8>,

    rejected: Option<StatusCode>,

    body_mode: BodyMode,
    body_remaining: u64,
    body_seen: u64,
    chunk_remaining: u64,
    chunk_digits: u8,

    head_request: bool,
    parsed_version: Version,
    parsed_status: StatusCode,
}

impl MessageParser {
    pub(crate) fn request(limits: ParserLimits) -> Self {
        Self::new(MessageKind::Request, limits)
    }

    pub(crate) fn response(limits: ParserLimits) -> Self {
        Self::new(MessageKind::Response, limits)
    }

    fn new(kind: MessageKind, limits: ParserLimits) -> Self {
        Self {
            kind,
            state: match kind {
                MessageKind::Request => ParseState::ReqStart,
                MessageKind::Response => ParseState::RespStart,
            },
            limits,
            pending: VecDeque::new(),
            method_buf: Vec::new(),
            target_buf: Vec::new(),
            target_len: 0,
            version_buf: Vec::new(),
            status_digits: Vec::new(),
            name_buf: Vec::new(),
            value_buf: Vec::new(),
            headers: HeaderMap::new(),
            header_bytes: 0,
            headers_over: false,
            in_trailers: false,
            trailer_line: Vec::new(),
            rejected: None,
            body_mode: BodyMode::None,
            body_remaining: 0,
            body_seen: 0,
            chunk_remaining: 0,
            chunk_digits: 0,
            head_request: false,
            parsed_version: Version::HTTP_11,
            parsed_status: StatusCode::OK,
        }
    }

    /// Tells a response parser the request was HEAD, suppressing the body.
    pub(crate) fn set_head_request(&mut self, head: bool) {
        self.head_request = head;
    }

    /// Whether the parser sits at a message boundary.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, ParseState::ReqStart | ParseState::RespStart)
            && self.pending.is_empty()
    }

    fn reset_message(&mut self) {
        self.state = match self.kind {
            MessageKind::Request => ParseState::ReqStart,
            MessageKind::Response => ParseState::RespStart,
        };
        self.method_buf.clear();
        self.target_buf.clear();
        self.target_len = 0;
        self.version_buf.clear();
        self.status_digits.clear();
        self.name_buf.clear();
        self.value_buf.clear();
        self.headers = HeaderMap::new();
        self.header_bytes = 0;
        self.headers_over = false;
        self.in_trailers = false;
        self.trailer_line.clear();
        self.rejected = None;
        self.body_mode = BodyMode::None;
        self.body_remaining = 0;
        self.body_seen = 0;
        self.chunk_remaining = 0;
        self.chunk_digits = 0;
    }

    /// Signals end of stream from the peer.
    pub(crate) fn on_eof(&mut self) -> ParseResult<Option<ParseEvent>> {
        match self.state {
            ParseState::UnspecifiedBody => {
                self.pending.push_back(ParseEvent::EndOfBody);
                self.pending.push_back(ParseEvent::Eof);
                self.reset_message();
                Ok(self.pending.pop_front())
            }
            ParseState::ReqStart | ParseState::RespStart => Ok(Some(ParseEvent::Eof)),
            ParseState::WebsocketHandoff => Ok(Some(ParseEvent::Eof)),
            _ => Err(ParseError::UnexpectedEof),
        }
    }

    /// Advances the machine, returning the next event or `None` when more
    /// bytes are needed.
    pub(crate) fn poll_event(&mut self, cur: &mut ByteCursor) -> ParseResult<Option<ParseEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.state {
                ParseState::FixedBody => {
                    if cur.remaining() == 0 {
                        return Ok(None);
                    }
                    let n = (cur.remaining() as u64).min(self.body_remaining) as usize;
                    let data = cur.take_bytes(n);
                    self.account_body(n as u64)?;
                    self.body_remaining -= n as u64;
                    let last = self.body_remaining == 0;
                    self.pending.push_back(ParseEvent::BodyChunk { data, last });
                    if last {
                        self.pending.push_back(ParseEvent::EndOfBody);
                        self.reset_message();
                    }
                }
                ParseState::ChunkData => {
                    if cur.remaining() == 0 {
                        return Ok(None);
                    }
                    let n = (cur.remaining() as u64).min(self.chunk_remaining) as usize;
                    let data = cur.take_bytes(n);
                    self.account_body(n as u64)?;
                    self.chunk_remaining -= n as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::ChunkDataRead;
                    }
                    self.pending
                        .push_back(ParseEvent::BodyChunk { data, last: false });
                }
                ParseState::UnspecifiedBody => {
                    if cur.remaining() == 0 {
                        return Ok(None);
                    }
                    let data = cur.take_bytes(cur.remaining());
                    self.account_body(data.len() as u64)?;
                    self.pending
                        .push_back(ParseEvent::BodyChunk { data, last: false });
                }
                ParseState::WebsocketHandoff => return Ok(None),
                _ => {
                    let Some(b) = cur.next_byte() else {
                        return Ok(None);
                    };
                    self.step(b)?;
                }
            }
        }
    }

    fn account_body(&mut self, n: u64) -> ParseResult<()> {
        self.body_seen += n;
        if self.body_seen > self.limits.max_body_size {
            return Err(ParseError::BodyTooLarge);
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, b: u8) -> ParseResult<()> {
        match self.state {
            ParseState::ReqStart => match b {
                b'\r' | b'\n' => {}
                _ if is_tchar(b) => {
                    self.method_buf.push(b);
                    self.state = ParseState::Method;
                }
                _ => return Err(ParseError::Malformed("request line start")),
            },
            ParseState::Method => match b {
                b' ' => self.state = ParseState::Target,
                _ if is_tchar(b) => {
                    if self.method_buf.len() >= 24 {
                        return Err(ParseError::Malformed("method token too long"));
                    }
                    self.method_buf.push(b);
                }
                _ => return Err(ParseError::Malformed("method token")),
            },
            ParseState::Target => match b {
                b' ' => self.state = ParseState::Version,
                0x21..=0x7e => {
                    self.target_len += 1;
                    if self.target_len > self.limits.max_url_size {
                        self.rejected.get_or_insert(StatusCode::URI_TOO_LONG);
                    } else {
                        self.target_buf.push(b);
                    }
                }
                _ => return Err(ParseError::Malformed("request target byte")),
            },
            ParseState::Version => match b {
                b'\r' => {
                    self.parsed_version = match self.version_buf.as_slice() {
                        b"HTTP/1.1" => Version::HTTP_11,
                        b"HTTP/1.0" => Version::HTTP_10,
                        _ => return Err(ParseError::InvalidVersion),
                    };
                    self.state = ParseState::ReqLineEnd;
                }
                _ => {
                    if self.version_buf.len() >= 8 {
                        return Err(ParseError::InvalidVersion);
                    }
                    self.version_buf.push(b);
                }
            },
            ParseState::ReqLineEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("request line end"));
                }
                self.state = ParseState::HeaderStart;
            }
            ParseState::RespStart => match b {
                b'\r' | b'\n' if self.version_buf.is_empty() => {}
                b' ' => {
                    self.parsed_version = match self.version_buf.as_slice() {
                        b"HTTP/1.1" => Version::HTTP_11,
                        b"HTTP/1.0" => Version::HTTP_10,
                        _ => return Err(ParseError::InvalidVersion),
                    };
                    self.state = ParseState::Status;
                }
                _ => {
                    if self.version_buf.len() >= 8 {
                        return Err(ParseError::InvalidVersion);
                    }
                    self.version_buf.push(b);
                }
            },
            ParseState::Status => match b {
                b'0'..=b'9' if self.status_digits.len() < 3 => self.status_digits.push(b),
                b' ' if self.status_digits.len() == 3 => self.state = ParseState::Reason,
                b'\r' if self.status_digits.len() == 3 => self.state = ParseState::StatusLineEnd,
                _ => return Err(ParseError::Malformed("status code")),
            },
            ParseState::Reason => match b {
                b'\r' => self.state = ParseState::StatusLineEnd,
                _ if is_value_byte(b) || b == b' ' => {}
                _ => return Err(ParseError::Malformed("reason phrase")),
            },
            ParseState::StatusLineEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("status line end"));
                }
                let code: u16 = std::str::from_utf8(&self.status_digits)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ParseError::Malformed("status code"))?;
                self.parsed_status = StatusCode::from_u16(code)
                    .map_err(|_| ParseError::Malformed("status code"))?;
                self.state = ParseState::HeaderStart;
            }
            ParseState::HeaderStart => match b {
                b'\r' => self.state = ParseState::HeadersEnd,
                _ if is_tchar(b) => {
                    self.name_buf.clear();
                    self.value_buf.clear();
                    self.name_buf.push(b.to_ascii_lowercase());
                    self.state = ParseState::HeaderName;
                }
                _ => return Err(ParseError::Malformed("header field start")),
            },
            ParseState::HeaderName => match b {
                b':' => {
                    if self.name_buf.is_empty() {
                        return Err(ParseError::Malformed("empty header name"));
                    }
                    self.state = ParseState::HeaderNameEnd;
                }
                _ if is_tchar(b) => self.name_buf.push(b.to_ascii_lowercase()),
                _ => return Err(ParseError::Malformed("header name byte")),
            },
            ParseState::HeaderNameEnd => match b {
                b' ' | b'\t' => {}
                b'\r' => self.state = ParseState::HeaderValueEnd,
                _ if is_value_byte(b) => {
                    self.value_buf.push(b);
                    self.state = ParseState::HeaderValue;
                }
                _ => return Err(ParseError::Malformed("header value start")),
            },
            ParseState::HeaderValue => match b {
                b'\r' => self.state = ParseState::HeaderValueEnd,
                _ if is_value_byte(b) => self.value_buf.push(b),
                _ => return Err(ParseError::Malformed("header value byte")),
            },
            ParseState::HeaderValueEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("header field end"));
                }
                self.commit_header()?;
                self.state = ParseState::HeaderStart;
            }
            ParseState::HeadersEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("header block end"));
                }
                self.finish_headers()?;
            }
            ParseState::ChunkStart => match b {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    self.chunk_remaining = 0;
                    self.chunk_digits = 0;
                    self.push_chunk_digit(b)?;
                    self.state = ParseState::ChunkSize;
                }
                _ => return Err(ParseError::Malformed("chunk size")),
            },
            ParseState::ChunkSize => match b {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => self.push_chunk_digit(b)?,
                b';' => self.state = ParseState::ChunkExts,
                b'\r' => self.state = ParseState::ChunkHeaderEnd,
                _ => return Err(ParseError::Malformed("chunk size byte")),
            },
            ParseState::ChunkExts => match b {
                b'\r' => self.state = ParseState::ChunkHeaderEnd,
                _ if is_value_byte(b) => {}
                _ => return Err(ParseError::Malformed("chunk extension byte")),
            },
            ParseState::ChunkHeaderEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("chunk header end"));
                }
                if self.chunk_remaining == 0 {
                    self.state = ParseState::LastChunk;
                } else {
                    self.state = ParseState::ChunkData;
                }
            }
            ParseState::ChunkDataRead => {
                if b != b'\r' {
                    return Err(ParseError::Malformed("chunk data end"));
                }
                self.state = ParseState::ChunkDataEnd;
            }
            ParseState::ChunkDataEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("chunk data end"));
                }
                self.state = ParseState::ChunkStart;
            }
            ParseState::LastChunk => match b {
                b'\r' => self.state = ParseState::ChunkedBodyEnd,
                _ if is_tchar(b) => {
                    self.in_trailers = true;
                    self.headers = HeaderMap::new();
                    self.trailer_line.clear();
                    self.trailer_line.push(b);
                    self.state = ParseState::Trailers;
                }
                _ => return Err(ParseError::Malformed("trailer start")),
            },
            ParseState::ChunkedBodyEnd => {
                if b != b'\n' {
                    return Err(ParseError::Malformed("chunked body end"));
                }
                if self.in_trailers {
                    let trailers = std::mem::take(&mut self.headers);
                    self.pending.push_back(ParseEvent::Trailers(trailers));
                }
                self.pending.push_back(ParseEvent::EndOfBody);
                self.reset_message();
            }
            ParseState::Trailers => {
                // Line oriented: accumulate until LF, then commit the field.
                // An empty line ends the trailer block.
                if b == b'\n' {
                    if self.trailer_line.last() == Some(&b'\r') {
                        self.trailer_line.pop();
                    }
                    if self.trailer_line.is_empty() {
                        let trailers = std::mem::take(&mut self.headers);
                        self.pending.push_back(ParseEvent::Trailers(trailers));
                        self.pending.push_back(ParseEvent::EndOfBody);
                        self.reset_message();
                    } else {
                        self.commit_trailer_line()?;
                        self.trailer_line.clear();
                    }
                } else {
                    self.header_bytes += 1;
                    if self.header_bytes > self.limits.max_headers_size {
                        return Err(ParseError::TrailersTooLarge);
                    }
                    self.trailer_line.push(b);
                }
            }
            ParseState::FixedBody
            | ParseState::ChunkData
            | ParseState::UnspecifiedBody
            | ParseState::WebsocketHandoff => {
                unreachable!("bulk states are handled in poll_event")
            }
        }
        Ok(())
    }

    fn push_chunk_digit(&mut self, b: u8) -> ParseResult<()> {
        self.chunk_digits += 1;
        if self.chunk_digits > 15 {
            return Err(ParseError::Malformed("chunk size overflow"));
        }
        let digit = u64::from((b as char).to_digit(16).unwrap_or(0));
        self.chunk_remaining = self.chunk_remaining << 4 | digit;
        Ok(())
    }

    fn commit_header(&mut self) -> ParseResult<()> {
        while self.value_buf.last() == Some(&b' ') || self.value_buf.last() == Some(&b'\t') {
            self.value_buf.pop();
        }
        self.header_bytes += self.name_buf.len() + self.value_buf.len() + 4;
        if self.header_bytes > self.limits.max_headers_size {
            self.headers_over = true;
            if self.kind == MessageKind::Request {
                self.rejected
                    .get_or_insert(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
            } else {
                return Err(ParseError::BufferExhausted);
            }
        }
        if !self.headers_over {
            let name = HeaderName::from_bytes(&self.name_buf)
                .map_err(|_| ParseError::Malformed("header name"))?;
            let value = HeaderValue::from_bytes(&self.value_buf)
                .map_err(|_| ParseError::Malformed("header value"))?;
            self.headers.append(name, value);
        }
        Ok(())
    }

    fn commit_trailer_line(&mut self) -> ParseResult<()> {
        let line = std::mem::take(&mut self.trailer_line);
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::Malformed("trailer field"))?;
        if colon == 0 {
            return Err(ParseError::Malformed("empty trailer name"));
        }
        let name_bytes: Vec<u8> = line[..colon]
            .iter()
            .map(u8::to_ascii_lowercase)
            .collect();
        if !name_bytes.iter().all(|&b| is_tchar(b)) {
            return Err(ParseError::Malformed("trailer name"));
        }
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
            value = &value[..value.len() - 1];
        }
        let name = HeaderName::from_bytes(&name_bytes)
            .map_err(|_| ParseError::Malformed("trailer name"))?;
        let value =
            HeaderValue::from_bytes(value).map_err(|_| ParseError::Malformed("trailer value"))?;
        self.headers.append(name, value);
        Ok(())
    }

    fn content_length(&self) -> ParseResult<Option<u64>> {
        let mut found: Option<u64> = None;
        for value in self.headers.get_all(header::CONTENT_LENGTH) {
            let text = value
                .to_str()
                .map_err(|_| ParseError::Malformed("content-length"))?;
            for part in text.split(',') {
                let n: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::Malformed("content-length"))?;
                if let Some(prev) = found {
                    if prev != n {
                        return Err(ParseError::Malformed("conflicting content-length"));
                    }
                }
                found = Some(n);
            }
        }
        Ok(found)
    }

    fn is_chunked(&self) -> bool {
        crate::http::header_contains_token(&self.headers, header::TRANSFER_ENCODING, "chunked")
    }

    fn finish_headers(&mut self) -> ParseResult<()> {
        match self.kind {
            MessageKind::Request => self.finish_request_headers(),
            MessageKind::Response => self.finish_response_headers(),
        }
    }

    fn finish_request_headers(&mut self) -> ParseResult<()> {
        let chunked = self.is_chunked();
        let content_length = self.content_length()?;
        self.body_mode = if chunked {
            BodyMode::Chunked
        } else {
            match content_length {
                Some(0) | None => BodyMode::None,
                Some(n) => BodyMode::Fixed(n),
            }
        };
        if let BodyMode::Fixed(n) = self.body_mode {
            if n > self.limits.max_body_size {
                return Err(ParseError::BodyTooLarge);
            }
            self.body_remaining = n;
        }

        let method = match Method::from_bytes(&self.method_buf) {
            Ok(m) => m,
            Err(_) => return Err(ParseError::Malformed("method")),
        };
        if !METHODS.contains(&self.method_buf.as_slice()) {
            self.rejected.get_or_insert(StatusCode::METHOD_NOT_ALLOWED);
        }

        let (path, raw_query, redirect) = self.split_target(&method)?;

        let connection_close = crate::http::header_contains_token(
            &self.headers,
            header::CONNECTION,
            "close",
        ) || (self.parsed_version == Version::HTTP_10
            && !crate::http::header_contains_token(
                &self.headers,
                header::CONNECTION,
                "keep-alive",
            ));
        let is_upgrade = crate::http::header_contains_token(
            &self.headers,
            header::CONNECTION,
            "upgrade",
        ) && crate::http::header_str(&self.headers, header::UPGRADE)
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let expects_continue = crate::http::header_str(&self.headers, header::EXPECT)
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);

        let head = RequestHead {
            method,
            path,
            raw_query,
            version: self.parsed_version,
            headers: std::mem::take(&mut self.headers),
            body_mode: self.body_mode,
            rejected: self.rejected.take(),
            redirect,
            expects_continue,
            connection_close,
            is_upgrade,
        };
        let body_mode = head.body_mode;
        let upgrade = head.is_upgrade;
        self.pending.push_back(ParseEvent::Request(Box::new(head)));

        if upgrade {
            self.state = ParseState::WebsocketHandoff;
            return Ok(());
        }
        match body_mode {
            BodyMode::None => {
                self.pending.push_back(ParseEvent::EndOfBody);
                self.reset_message();
            }
            BodyMode::Fixed(_) => self.state = ParseState::FixedBody,
            BodyMode::Chunked => self.state = ParseState::ChunkStart,
            BodyMode::Unspecified => {
                return Err(ParseError::Malformed("request body without length"))
            }
        }
        Ok(())
    }

    fn finish_response_headers(&mut self) -> ParseResult<()> {
        let status = self.parsed_status;
        let chunked = self.is_chunked();
        let content_length = self.content_length()?;
        let no_body = self.head_request || crate::http::status_forbids_body(status);
        self.body_mode = if no_body {
            BodyMode::None
        } else if chunked {
            BodyMode::Chunked
        } else {
            match content_length {
                Some(0) => BodyMode::None,
                Some(n) => BodyMode::Fixed(n),
                None => BodyMode::Unspecified,
            }
        };
        if let BodyMode::Fixed(n) = self.body_mode {
            self.body_remaining = n;
        }

        let head = ResponseHead {
            status,
            version: self.parsed_version,
            headers: std::mem::take(&mut self.headers),
            body_mode: self.body_mode,
        };
        let body_mode = head.body_mode;
        self.pending.push_back(ParseEvent::Response(Box::new(head)));
        match body_mode {
            BodyMode::None => {
                self.pending.push_back(ParseEvent::EndOfBody);
                self.reset_message();
            }
            BodyMode::Fixed(_) => self.state = ParseState::FixedBody,
            BodyMode::Chunked => self.state = ParseState::ChunkStart,
            BodyMode::Unspecified => self.state = ParseState::UnspecifiedBody,
        }
        Ok(())
    }

    /// Splits the raw target into path, query and a possible redirect for
    /// authority-form targets lacking a scheme.
    fn split_target(&mut self, method: &Method) -> ParseResult<(String, Option<String>, Option<String>)> {
        let raw = std::mem::take(&mut self.target_buf);
        if raw.is_empty() {
            return Err(ParseError::Malformed("empty request target"));
        }
        let (path_part, query) = match raw.iter().position(|&b| b == b'?') {
            Some(pos) => {
                let query = String::from_utf8_lossy(&raw[pos + 1..]).into_owned();
                (&raw[..pos], Some(query))
            }
            None => (&raw[..], None),
        };

        if *method == Method::CONNECT {
            return Ok((String::from_utf8_lossy(path_part).into_owned(), query, None));
        }
        if path_part == b"*" {
            return Ok(("*".to_owned(), query, None));
        }
        if path_part.starts_with(b"//") {
            // Authority form without a scheme: point the client at the
            // relative form instead.
            let after = &path_part[2..];
            let rel = match after.iter().position(|&b| b == b'/') {
                Some(pos) => canonicalize_path(&after[pos..]),
                None => "/".to_owned(),
            };
            let mut target = rel.clone();
            if let Some(q) = &query {
                target.push('?');
                target.push_str(q);
            }
            return Ok((rel, query, Some(target)));
        }
        if let Some(pos) = find_scheme_end(path_part) {
            let after = &path_part[pos..];
            let path = match after.iter().position(|&b| b == b'/') {
                Some(slash) => canonicalize_path(&after[slash..]),
                None => "/".to_owned(),
            };
            return Ok((path, query, None));
        }
        if path_part[0] != b'/' {
            return Err(ParseError::Malformed("request target form"));
        }
        Ok((canonicalize_path(path_part), query, None))
    }
}

/// Position just past `scheme://`, if the target is absolute-form.
fn find_scheme_end(target: &[u8]) -> Option<usize> {
    if !target.first()?.is_ascii_alphabetic() {
        return None;
    }
    let pos = target.windows(3).position(|w| w == b"://")?;
    Some(pos + 3)
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn limits() -> ParserLimits {
        ParserLimits {
            max_url_size: 8175,
            max_headers_size: 8192,
            max_body_size: 24 * 1024 * 1024,
        }
    }

    fn cursor(input: &[u8]) -> ByteCursor {
        let mut cur = ByteCursor::with_capacity(input.len().max(16), 64 * 1024);
        cur.writable().put_slice(input);
        cur
    }

    fn drain(parser: &mut MessageParser, cur: &mut ByteCursor) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        while let Some(event) = parser.poll_event(cur).expect("parse") {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_simple_get() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"GET /blah HTTP/1.1\r\nHost: x\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(head.method, Method::GET);
                assert_eq!(head.path, "/blah");
                assert_eq!(head.version, Version::HTTP_11);
                assert_eq!(head.headers.get("host").map(|v| v.as_bytes()), Some(&b"x"[..]));
                assert_eq!(head.body_mode, BodyMode::None);
                assert!(head.rejected.is_none());
            }
            other => panic!("expected request head, got {other:?}"),
        }
        assert!(matches!(events[1], ParseEvent::EndOfBody));
        assert!(parser.is_idle());
    }

    #[test]
    fn test_fragmented_input() {
        let raw = b"POST /p?x=1 HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
        let mut parser = MessageParser::request(limits());
        let mut cur = ByteCursor::with_capacity(16, 64 * 1024);
        let mut head = None;
        let mut body = Vec::new();
        let mut ended = false;
        for &b in raw.iter() {
            cur.writable().put_u8(b);
            while let Some(event) = parser.poll_event(&mut cur).expect("parse") {
                match event {
                    ParseEvent::Request(h) => head = Some(h),
                    ParseEvent::BodyChunk { data, .. } => body.extend_from_slice(&data),
                    ParseEvent::EndOfBody => ended = true,
                    other => panic!("unexpected: {other:?}"),
                }
            }
        }
        let head = head.expect("head");
        assert_eq!(head.raw_query.as_deref(), Some("x=1"));
        assert_eq!(head.body_mode, BodyMode::Fixed(5));
        assert_eq!(&body[..], b"hello");
        assert!(ended);
    }

    #[test]
    fn test_chunked_with_extensions_and_trailers() {
        let raw = b"POST /up HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n\
                    5;ext=1\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\
                    server-timing: total;dur=123.4\r\n\r\n";
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(raw);
        let events = drain(&mut parser, &mut cur);
        let mut body = Vec::new();
        let mut trailers = None;
        for event in &events {
            match event {
                ParseEvent::BodyChunk { data, .. } => body.extend_from_slice(data),
                ParseEvent::Trailers(fields) => trailers = Some(fields.clone()),
                _ => {}
            }
        }
        assert_eq!(&body[..], b"hello world");
        let trailers = trailers.expect("trailers");
        assert_eq!(
            trailers.get("server-timing").map(|v| v.as_bytes()),
            Some(&b"total;dur=123.4"[..])
        );
        assert!(matches!(events.last(), Some(ParseEvent::EndOfBody)));
        assert!(parser.is_idle());
    }

    #[test]
    fn test_chunked_roundtrip_boundary() {
        // chunk sizes split across arbitrary feeds still reassemble exactly.
        let payload: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
        let mut wire = Vec::new();
        wire.extend_from_slice(b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n");
        for chunk in payload.chunks(777) {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\n\r\n");

        let mut parser = MessageParser::request(limits());
        let mut cur = ByteCursor::with_capacity(64, 64 * 1024);
        let mut body = Vec::new();
        for piece in wire.chunks(13) {
            cur.writable().put_slice(piece);
            while let Some(event) = parser.poll_event(&mut cur).expect("parse") {
                if let ParseEvent::BodyChunk { data, .. } = event {
                    body.extend_from_slice(&data);
                }
            }
        }
        assert_eq!(body, payload);
    }

    #[test]
    fn test_unknown_method_marked_405() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"BREW /pot HTTP/1.1\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(head.rejected, Some(StatusCode::METHOD_NOT_ALLOWED));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_url_boundary() {
        let limits = ParserLimits {
            max_url_size: 16,
            ..self::limits()
        };
        // Exactly at the limit: accepted.
        let mut parser = MessageParser::request(limits);
        let path = format!("/{}", "a".repeat(15));
        let mut cur = cursor(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes());
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert!(head.rejected.is_none());
                assert_eq!(head.path, path);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // One byte over: 414 recorded, message still consumed.
        let mut parser = MessageParser::request(limits);
        let mut cur = cursor(format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(16)).as_bytes());
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(head.rejected, Some(StatusCode::URI_TOO_LONG));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parser.is_idle());
    }

    #[test]
    fn test_headers_boundary() {
        let limits = ParserLimits {
            max_headers_size: 64,
            ..self::limits()
        };
        // name + value + 4 == 64: exactly at the budget, accepted.
        let mut parser = MessageParser::request(limits);
        let mut cur = cursor(
            format!("GET / HTTP/1.1\r\nx-filler: {}\r\n\r\n", "v".repeat(51)).as_bytes(),
        );
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert!(head.rejected.is_none());
                assert!(head.headers.contains_key("x-filler"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // One byte over: 431 recorded, message still consumed.
        let mut parser = MessageParser::request(limits);
        let mut cur = cursor(
            format!("GET / HTTP/1.1\r\nx-filler: {}\r\n\r\n", "v".repeat(52)).as_bytes(),
        );
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(
                    head.rejected,
                    Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parser.is_idle());
    }

    #[test]
    fn test_content_length_zero_no_body_states() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"POST / HTTP/1.1\r\ncontent-length: 0\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => assert_eq!(head.body_mode, BodyMode::None),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(events[1], ParseEvent::EndOfBody));
    }

    #[test]
    fn test_conflicting_content_length_rejected() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"POST / HTTP/1.1\r\ncontent-length: 2\r\ncontent-length: 3\r\n\r\n");
        let err = loop {
            match parser.poll_event(&mut cur) {
                Ok(Some(_)) => {}
                Ok(None) => panic!("expected failure"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_percent_decoding_unreserved_only() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"GET /a%7Eb%2Dc%2e%5F/%41%20x HTTP/1.1\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(head.path, "/a~b-c._/%41%20x");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_authority_form_redirect() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"GET //evil.example/blah?x=1 HTTP/1.1\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        match &events[0] {
            ParseEvent::Request(head) => {
                assert_eq!(head.redirect.as_deref(), Some("/blah?x=1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_response_eof_delimited_body() {
        let mut parser = MessageParser::response(limits());
        let mut cur = cursor(b"HTTP/1.1 200 OK\r\nx: y\r\n\r\npartial body");
        let events = drain(&mut parser, &mut cur);
        assert!(matches!(&events[0], ParseEvent::Response(head) if head.body_mode == BodyMode::Unspecified));
        assert!(matches!(&events[1], ParseEvent::BodyChunk { .. }));
        let end = parser.on_eof().expect("eof");
        assert!(matches!(end, Some(ParseEvent::EndOfBody)));
    }

    #[test]
    fn test_response_304_has_no_body() {
        let mut parser = MessageParser::response(limits());
        let mut cur = cursor(b"HTTP/1.1 304 Not Modified\r\ncontent-length: 20\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        assert!(matches!(&events[0], ParseEvent::Response(head) if head.body_mode == BodyMode::None));
        assert!(matches!(events[1], ParseEvent::EndOfBody));
    }

    #[test]
    fn test_keepalive_back_to_back() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nconnection: close\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        let heads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Request(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].path, "/a");
        assert!(!heads[0].connection_close);
        assert_eq!(heads[1].path, "/b");
        assert!(heads[1].connection_close);
    }

    #[test]
    fn test_mid_message_eof_is_error() {
        let mut parser = MessageParser::request(limits());
        let mut cur = cursor(b"GET /partial HTT");
        assert!(parser.poll_event(&mut cur).expect("parse").is_none());
        assert!(matches!(parser.on_eof(), Err(ParseError::UnexpectedEof)));
    }

    #[test]
    fn test_body_budget_enforced() {
        let limits = ParserLimits {
            max_body_size: 4,
            ..self::limits()
        };
        let mut parser = MessageParser::request(limits);
        let mut cur = cursor(b"POST / HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello");
        let err = loop {
            match parser.poll_event(&mut cur) {
                Ok(Some(_)) => {}
                Ok(None) => panic!("expected failure"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, ParseError::BodyTooLarge));
    }

    #[test]
    fn test_websocket_upgrade_parks_parser() {
        let mut parser = MessageParser::request(limits());
        let mut cur =
            cursor(b"GET /chat HTTP/1.1\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n");
        let events = drain(&mut parser, &mut cur);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ParseEvent::Request(head) if head.is_upgrade));
        assert!(!parser.is_idle());
    }
}
