//! HTTP/1.1 response serializer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::conf::ServerConfig;
use crate::exchange::ResponseMeta;
use crate::http::{header, status_forbids_body, HeaderMap, HeaderValue, StatusCode, Version};
use crate::{Error, Result};

/// Per-exchange facts the serializer needs from the request side.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResponseContext {
    pub(crate) head_request: bool,
    /// Write `Connection: close` and close after this exchange.
    pub(crate) close: bool,
    /// The client sent `TE: trailers`.
    pub(crate) allow_trailers: bool,
    /// The client sent `Accept-Encoding: gzip`.
    pub(crate) accepts_gzip: bool,
}

/// Output progress, one response at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WriteState {
    #[default]
    Nothing,
    FullSent,
    Streaming,
    StreamingComplete,
}

#[derive(Debug)]
enum WireBody {
    None,
    Fixed { remaining: u64 },
    Chunked,
}

/// Serializes one response at a time into a staging buffer.
pub(crate) struct ResponseWriter {
    conf: std::sync::Arc<ServerConfig>,
    state: WriteState,
    body: WireBody,
    ctx: ResponseContext,
    suppress_body: bool,
    #[cfg(feature = "gzip")]
    gzip: Option<flate2::write::GzEncoder<Vec<u8>>>,
}

impl ResponseWriter {
    pub(crate) fn new(conf: std::sync::Arc<ServerConfig>) -> Self {
        Self {
            conf,
            state: WriteState::default(),
            body: WireBody::None,
            ctx: ResponseContext::default(),
            suppress_body: false,
            #[cfg(feature = "gzip")]
            gzip: None,
        }
    }

    /// Resets for the next exchange on the connection.
    pub(crate) fn begin(&mut self, ctx: ResponseContext) {
        self.state = WriteState::Nothing;
        self.body = WireBody::None;
        self.ctx = ctx;
        self.suppress_body = false;
        #[cfg(feature = "gzip")]
        {
            self.gzip = None;
        }
    }

    pub(crate) fn state(&self) -> WriteState {
        self.state
    }

    fn status_of(meta: &ResponseMeta) -> StatusCode {
        meta.status.unwrap_or(StatusCode::OK)
    }

    #[cfg(feature = "gzip")]
    fn gzip_eligible(&self, headers: &HeaderMap, body_len: Option<u64>) -> bool {
        if !self.conf.gzip.enabled || !self.ctx.accepts_gzip || self.suppress_body {
            return false;
        }
        if headers.contains_key(header::CONTENT_ENCODING) {
            return false;
        }
        let Some(content_type) = crate::http::header_str(headers, header::CONTENT_TYPE) else {
            return false;
        };
        if !self.conf.gzip.mime_allowed(content_type) {
            return false;
        }
        body_len.map_or(true, |len| len >= self.conf.gzip.min_gzip_size)
    }

    /// Emits the complete response: status line, headers and body.
    pub(crate) fn write_full(
        &mut self,
        meta: &ResponseMeta,
        body: Bytes,
        out: &mut BytesMut,
    ) -> Result<()> {
        if self.state != WriteState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        self.state = WriteState::FullSent;
        let status = Self::status_of(meta);
        let mut headers = meta.headers.clone();
        self.suppress_body = self.ctx.head_request || status_forbids_body(status);

        let mut body = body;
        if status_forbids_body(status) {
            headers.remove(header::CONTENT_LENGTH);
            body = Bytes::new();
            self.write_head(meta.version, status, &headers, out);
            return Ok(());
        }

        #[cfg(feature = "gzip")]
        if self.gzip_eligible(&headers, Some(body.len() as u64)) {
            use std::io::Write;
            let mut encoder = flate2::write::GzEncoder::new(
                Vec::with_capacity(body.len() / 2 + 64),
                flate2::Compression::default(),
            );
            if encoder.write_all(&body).and_then(|()| encoder.try_finish()).is_ok() {
                body = Bytes::from(encoder.finish().unwrap_or_default());
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
            }
        }

        if let Some(declared) = content_length_of(&headers) {
            if (body.len() as u64) > declared {
                tracing::warn!(
                    declared,
                    actual = body.len(),
                    "response body overruns declared content-length; truncating"
                );
                body = body.slice(..declared as usize);
            }
        }
        set_content_length(&mut headers, body.len() as u64);
        self.write_head(meta.version, status, &headers, out);
        if !self.ctx.head_request {
            out.put_slice(&body);
        }
        Ok(())
    }

    /// Emits status and headers for a streamed body.
    pub(crate) fn write_streaming_headers(
        &mut self,
        meta: &ResponseMeta,
        out: &mut BytesMut,
    ) -> Result<()> {
        if self.state != WriteState::Nothing {
            return Err(Error::AlreadyCompleted);
        }
        self.state = WriteState::Streaming;
        let status = Self::status_of(meta);
        let mut headers = meta.headers.clone();
        self.suppress_body = self.ctx.head_request || status_forbids_body(status);

        if status_forbids_body(status) {
            headers.remove(header::CONTENT_LENGTH);
            self.body = WireBody::None;
        } else if let Some(declared) = content_length_of(&headers) {
            self.body = WireBody::Fixed {
                remaining: declared,
            };
        } else {
            #[cfg(feature = "gzip")]
            if self.gzip_eligible(&headers, None) {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
                self.gzip = Some(flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                ));
            }
            headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
            if self.ctx.allow_trailers && !meta.trailers.is_empty() {
                // Advertised so the client knows to expect the block.
                if let Ok(names) = trailer_names(&meta.trailers) {
                    headers.insert(header::TRAILER, names);
                }
            }
            self.body = WireBody::Chunked;
        }
        self.write_head(meta.version, status, &headers, out);
        Ok(())
    }

    /// Emits one streamed body chunk.
    pub(crate) fn write_chunk(&mut self, data: Bytes, out: &mut BytesMut) -> Result<()> {
        if self.state != WriteState::Streaming {
            return Err(Error::AlreadyCompleted);
        }
        if self.suppress_body || data.is_empty() {
            return Ok(());
        }
        match &mut self.body {
            WireBody::None => {}
            WireBody::Fixed { remaining } => {
                let allowed = (*remaining).min(data.len() as u64) as usize;
                if allowed < data.len() {
                    tracing::warn!(
                        over = data.len() - allowed,
                        "write overruns declared content-length; truncating"
                    );
                }
                out.put_slice(&data[..allowed]);
                *remaining -= allowed as u64;
            }
            WireBody::Chunked => {
                #[cfg(feature = "gzip")]
                if let Some(encoder) = &mut self.gzip {
                    use std::io::Write;
                    if encoder.write_all(&data).and_then(|()| encoder.flush()).is_err() {
                        return Err(Error::other("gzip encoding failed"));
                    }
                    let compressed = std::mem::take(encoder.get_mut());
                    put_chunk(&compressed, out);
                    return Ok(());
                }
                put_chunk(&data, out);
            }
        }
        Ok(())
    }

    /// Emits the body terminator and the trailer block when negotiated.
    pub(crate) fn finish(&mut self, trailers: &HeaderMap, out: &mut BytesMut) -> Result<()> {
        if self.state != WriteState::Streaming {
            return Err(Error::AlreadyCompleted);
        }
        self.state = WriteState::StreamingComplete;
        match &self.body {
            WireBody::None => Ok(()),
            WireBody::Fixed { remaining } => {
                if *remaining > 0 && !self.suppress_body {
                    return Err(Error::other(
                        "response ended short of its declared content-length",
                    ));
                }
                Ok(())
            }
            WireBody::Chunked => {
                if self.suppress_body {
                    return Ok(());
                }
                #[cfg(feature = "gzip")]
                if let Some(encoder) = self.gzip.take() {
                    if let Ok(rest) = encoder.finish() {
                        put_chunk(&rest, out);
                    }
                }
                out.put_slice(b"0\r\n");
                if self.ctx.allow_trailers {
                    for (name, value) in trailers {
                        out.put_slice(name.as_str().as_bytes());
                        out.put_slice(b": ");
                        out.put_slice(value.as_bytes());
                        out.put_slice(b"\r\n");
                    }
                } else if !trailers.is_empty() {
                    tracing::debug!("dropping response trailers: client did not send TE: trailers");
                }
                out.put_slice(b"\r\n");
                Ok(())
            }
        }
    }

    fn write_head(
        &mut self,
        version: Version,
        status: StatusCode,
        headers: &HeaderMap,
        out: &mut BytesMut,
    ) {
        let version = match version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        out.put_slice(version.as_bytes());
        out.put_u8(b' ');
        out.put_slice(status.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in headers {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        if !headers.contains_key(header::DATE) {
            out.put_slice(b"date: ");
            out.put_slice(crate::http::date::http_date_value().as_bytes());
            out.put_slice(b"\r\n");
        }
        if self.ctx.close && !headers.contains_key(header::CONNECTION) {
            out.put_slice(b"connection: close\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

fn put_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn content_length_of(headers: &HeaderMap) -> Option<u64> {
    crate::http::header_str(headers, header::CONTENT_LENGTH)?.trim().parse().ok()
}

fn set_content_length(headers: &mut HeaderMap, len: u64) {
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

fn trailer_names(trailers: &HeaderMap) -> std::result::Result<HeaderValue, http::header::InvalidHeaderValue> {
    let names: Vec<&str> = trailers.keys().map(http::HeaderName::as_str).collect();
    HeaderValue::from_str(&names.join(", "))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::exchange::ResponseMeta;

    fn writer(ctx: ResponseContext) -> ResponseWriter {
        let mut w = ResponseWriter::new(Arc::new(ServerConfig::new()));
        w.begin(ctx);
        w
    }

    fn meta(status: Option<StatusCode>) -> ResponseMeta {
        let mut m = ResponseMeta::new(Version::HTTP_11);
        m.status = status;
        m
    }

    fn text(out: &BytesMut) -> String {
        String::from_utf8_lossy(out).into_owned()
    }

    #[test]
    fn test_full_response_sets_content_length() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        w.write_full(&meta(None), Bytes::from_static(b"Hello 0"), &mut out)
            .expect("write");
        let text = text(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("content-length: 7\r\n"));
        assert!(text.contains("date: "));
        assert!(text.ends_with("Hello 0"));
        assert!(matches!(w.state(), WriteState::FullSent));
    }

    #[test]
    fn test_second_write_fails() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        w.write_full(&meta(None), Bytes::new(), &mut out).expect("write");
        assert!(matches!(
            w.write_full(&meta(None), Bytes::new(), &mut out),
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(
            w.write_streaming_headers(&meta(None), &mut out),
            Err(Error::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_head_request_gets_headers_only() {
        let mut w = writer(ResponseContext {
            head_request: true,
            ..ResponseContext::default()
        });
        let mut out = BytesMut::new();
        w.write_full(&meta(None), Bytes::from_static(b"body bytes"), &mut out)
            .expect("write");
        let text = text(&out);
        assert!(text.contains("content-length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n"), "no body bytes expected: {text}");
    }

    #[test]
    fn test_204_strips_content_length() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        let mut m = meta(Some(StatusCode::NO_CONTENT));
        m.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        m.headers.insert("hello", HeaderValue::from_static("world"));
        w.write_full(&m, Bytes::from_static(b"drop!"), &mut out).expect("write");
        let text = text(&out);
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("content-length"));
        assert!(text.contains("hello: world\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_chunked_streaming_with_trailers() {
        let mut w = writer(ResponseContext {
            allow_trailers: true,
            ..ResponseContext::default()
        });
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.trailers.insert("server-timing", HeaderValue::from_static("total;dur=123.4"));
        w.write_streaming_headers(&m, &mut out).expect("headers");
        w.write_chunk(Bytes::from_static(b"Hello"), &mut out).expect("chunk");
        w.write_chunk(Bytes::from_static(b" "), &mut out).expect("chunk");
        w.write_chunk(Bytes::from_static(b"world"), &mut out).expect("chunk");
        w.finish(&m.trailers, &mut out).expect("finish");
        let text = text(&out);
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.contains("5\r\nHello\r\n"));
        assert!(text.contains("1\r\n \r\n"));
        assert!(text.contains("5\r\nworld\r\n"));
        assert!(text.ends_with("0\r\nserver-timing: total;dur=123.4\r\n\r\n"));
    }

    #[test]
    fn test_trailers_dropped_without_negotiation() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.trailers.insert("server-timing", HeaderValue::from_static("a"));
        w.write_streaming_headers(&m, &mut out).expect("headers");
        w.write_chunk(Bytes::from_static(b"x"), &mut out).expect("chunk");
        w.finish(&m.trailers, &mut out).expect("finish");
        let text = text(&out);
        assert!(!text.contains("server-timing"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn test_fixed_streaming_truncates_overrun() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        w.write_streaming_headers(&m, &mut out).expect("headers");
        w.write_chunk(Bytes::from_static(b"abcdef"), &mut out).expect("chunk");
        w.finish(&HeaderMap::new(), &mut out).expect("finish");
        let text = text(&out);
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.ends_with("abcd"));
    }

    #[test]
    fn test_fixed_streaming_underrun_errors() {
        let mut w = writer(ResponseContext::default());
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        w.write_streaming_headers(&m, &mut out).expect("headers");
        w.write_chunk(Bytes::from_static(b"abc"), &mut out).expect("chunk");
        assert!(w.finish(&HeaderMap::new(), &mut out).is_err());
    }

    #[test]
    fn test_connection_close_header() {
        let mut w = writer(ResponseContext {
            close: true,
            ..ResponseContext::default()
        });
        let mut out = BytesMut::new();
        w.write_full(&meta(None), Bytes::new(), &mut out).expect("write");
        assert!(text(&out).contains("connection: close\r\n"));
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_full_body() {
        use std::io::Read;

        let mut w = writer(ResponseContext {
            accepts_gzip: true,
            ..ResponseContext::default()
        });
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=utf-8"),
        );
        let payload = "z".repeat(4000);
        w.write_full(&m, Bytes::from(payload.clone()), &mut out).expect("write");
        let text_head = text(&out);
        assert!(text_head.contains("content-encoding: gzip\r\n"));
        assert!(text_head.contains("vary: accept-encoding\r\n"));
        let body_start = out.windows(4).position(|w| w == b"\r\n\r\n").expect("head end") + 4;
        let mut decoder = flate2::read::GzDecoder::new(&out[body_start..]);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).expect("gunzip");
        assert_eq!(decoded, payload);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_skipped_below_min_size() {
        let mut w = writer(ResponseContext {
            accepts_gzip: true,
            ..ResponseContext::default()
        });
        let mut out = BytesMut::new();
        let mut m = meta(None);
        m.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        w.write_full(&m, Bytes::from_static(b"tiny"), &mut out).expect("write");
        assert!(!text(&out).contains("content-encoding"));
    }
}
