//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

/// What to do when a request body exceeds `max_request_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TooLargeAction {
    /// Respond `413 Payload Too Large` and close the connection.
    #[default]
    SendResponse,
    /// Drop the connection without a response.
    KillConnection,
}

/// Gzip negotiation settings consumed by the response writer.
#[derive(Debug, Clone)]
pub struct GzipConfig {
    /// Whether gzip encoding is offered at all.
    pub enabled: bool,
    /// Bodies smaller than this are not worth compressing.
    pub min_gzip_size: u64,
    /// Content types eligible for compression. Matched against the value up
    /// to any `;` parameter.
    pub mime_types: Vec<String>,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_gzip_size: 1400,
            mime_types: [
                "text/plain",
                "text/html",
                "text/css",
                "text/xml",
                "application/json",
                "application/javascript",
                "application/xml",
                "image/svg+xml",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
        }
    }
}

impl GzipConfig {
    pub(crate) fn mime_allowed(&self, content_type: &str) -> bool {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        self.mime_types.iter().any(|m| m.eq_ignore_ascii_case(essence))
    }
}

/// Settings for a [`Server`](crate::Server).
///
/// Built with chained setters:
///
/// ```
/// use rampart_core::conf::ServerConfig;
///
/// let conf = ServerConfig::new()
///     .http_port(0)
///     .max_request_size(4 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerConfig {
    /// Cleartext HTTP/1.1 port. `-1` disables the listener, `0` picks any
    /// free port.
    pub http_port: i32,
    /// TLS port (H1 and H2 via ALPN). `-1` disables the listener, `0` picks
    /// any free port.
    pub https_port: i32,
    /// Cumulative request header byte budget. Exceeding rejects with 431.
    pub max_headers_size: usize,
    /// Request target byte budget. Exceeding rejects with 414.
    pub max_url_size: usize,
    /// Request body byte budget. Exceeding rejects per
    /// [`too_large_action`](Self::too_large_action).
    pub max_request_size: u64,
    /// See [`TooLargeAction`].
    pub too_large_action: TooLargeAction,
    /// No bytes read or written on the connection.
    pub idle_timeout: Duration,
    /// Request body bytes awaited without progress.
    pub request_read_timeout: Duration,
    /// A socket write pending without completing.
    pub response_write_timeout: Duration,
    /// Gzip negotiation settings.
    pub gzip: GzipConfig,
    /// Maximum concurrently executing handler invocations. `None` is
    /// unbounded; when a bounded executor has no free slot the request is
    /// answered `503`.
    pub handler_executor_limit: Option<usize>,
    /// I/O worker threads used when the server owns its runtime.
    pub nio_threads: usize,
    /// Maximum concurrent HTTP/2 streams advertised per connection.
    pub max_concurrent_streams: u32,
    /// Exchanges served on one HTTP/1.1 connection before it is closed.
    /// `None` keeps connections alive indefinitely.
    pub max_keepalive_requests: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 0,
            https_port: -1,
            max_headers_size: 8192,
            max_url_size: 8175,
            max_request_size: 24 * 1024 * 1024,
            too_large_action: TooLargeAction::default(),
            idle_timeout: Duration::from_secs(10 * 60),
            request_read_timeout: Duration::from_secs(2 * 60),
            response_write_timeout: Duration::from_secs(2 * 60),
            gzip: GzipConfig::default(),
            handler_executor_limit: None,
            nio_threads: default_nio_threads(),
            max_concurrent_streams: 128,
            max_keepalive_requests: None,
        }
    }
}

fn default_nio_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (2 * cpus).min(16)
}

impl ServerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cleartext HTTP port. `-1` disables, `0` picks any free port.
    #[must_use]
    pub fn http_port(mut self, port: i32) -> Self {
        self.http_port = port;
        self
    }

    /// Sets the TLS port. `-1` disables, `0` picks any free port.
    #[must_use]
    pub fn https_port(mut self, port: i32) -> Self {
        self.https_port = port;
        self
    }

    /// Sets the cumulative request header byte budget.
    #[must_use]
    pub fn max_headers_size(mut self, size: usize) -> Self {
        self.max_headers_size = size;
        self
    }

    /// Sets the request target byte budget.
    #[must_use]
    pub fn max_url_size(mut self, size: usize) -> Self {
        self.max_url_size = size;
        self
    }

    /// Sets the request body byte budget.
    #[must_use]
    pub fn max_request_size(mut self, size: u64) -> Self {
        self.max_request_size = size;
        self
    }

    /// Sets the reaction to an oversized request body.
    #[must_use]
    pub fn too_large_action(mut self, action: TooLargeAction) -> Self {
        self.too_large_action = action;
        self
    }

    /// Sets the connection idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the request body read timeout.
    #[must_use]
    pub fn request_read_timeout(mut self, timeout: Duration) -> Self {
        self.request_read_timeout = timeout;
        self
    }

    /// Sets the response write timeout.
    #[must_use]
    pub fn response_write_timeout(mut self, timeout: Duration) -> Self {
        self.response_write_timeout = timeout;
        self
    }

    /// Replaces the gzip settings.
    #[must_use]
    pub fn gzip(mut self, gzip: GzipConfig) -> Self {
        self.gzip = gzip;
        self
    }

    /// Bounds concurrently executing handler invocations.
    #[must_use]
    pub fn handler_executor_limit(mut self, limit: impl Into<Option<usize>>) -> Self {
        self.handler_executor_limit = limit.into();
        self
    }

    /// Sets the I/O worker thread count used by [`Server::run`](crate::Server::run).
    #[must_use]
    pub fn nio_threads(mut self, threads: usize) -> Self {
        self.nio_threads = threads.max(1);
        self
    }

    /// Sets the advertised HTTP/2 `MAX_CONCURRENT_STREAMS`.
    #[must_use]
    pub fn max_concurrent_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = streams.max(1);
        self
    }

    /// Caps how many exchanges one keep-alive connection serves.
    #[must_use]
    pub fn max_keepalive_requests(mut self, cap: impl Into<Option<u64>>) -> Self {
        self.max_keepalive_requests = cap.into();
        self
    }

    /// The largest single token the read buffer must be able to hold.
    #[must_use]
    pub fn max_buffer_size(&self) -> usize {
        self.max_url_size.max(self.max_headers_size) + 256
    }

    /// Wraps the config for sharing across connection tasks.
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = ServerConfig::new();
        assert_eq!(conf.max_headers_size, 8192);
        assert_eq!(conf.max_url_size, 8175);
        assert_eq!(conf.max_request_size, 24 * 1024 * 1024);
        assert_eq!(conf.idle_timeout, Duration::from_secs(600));
        assert!(conf.nio_threads >= 1 && conf.nio_threads <= 16);
    }

    #[test]
    fn test_mime_allowed() {
        let gzip = GzipConfig::default();
        assert!(gzip.mime_allowed("text/html;charset=utf-8"));
        assert!(gzip.mime_allowed("APPLICATION/JSON"));
        assert!(!gzip.mime_allowed("image/png"));
    }
}
