//! Error types used throughout rampart.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;

use crate::http::{StatusCode, StatusError};
use crate::proto::ParseError;

/// A boxed error type for dynamic error handling.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Which deadline fired when an exchange times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// No bytes read or written on the connection for the idle timeout.
    Idle,
    /// Request body bytes were awaited without progress.
    RequestRead,
    /// A socket write was pending too long.
    ResponseWrite,
}

impl TimeoutCause {
    /// The status code reported to the client when the response has not
    /// started yet.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Idle | Self::RequestRead => StatusCode::REQUEST_TIMEOUT,
            Self::ResponseWrite => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// The main error type used throughout rampart.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Standard I/O error.
    Io(IoError),
    /// Wire-level parse or framing error on the request side.
    Parse(ParseError),
    /// HTTP status error with an associated status code.
    Status(StatusError),
    /// TLS handshake or record-layer failure.
    Tls(BoxedError),
    /// The application executor refused the task.
    Overloaded,
    /// The peer closed or reset the connection mid exchange.
    Disconnected,
    /// A deadline fired.
    Timeout(TimeoutCause),
    /// An absolute-form request target must be answered with a redirect to
    /// its relative form.
    Redirect(String),
    /// A handler returned `NotHandled` after claiming async completion.
    IllegalHandlerState(&'static str),
    /// A response write was attempted past a terminal output state.
    AlreadyCompleted,
    /// Any other error type wrapped as a boxed trait object.
    Other(BoxedError),
}

impl Error {
    /// Creates an `Error` from any error type.
    #[inline]
    pub fn other(error: impl Into<BoxedError>) -> Self {
        Self::Other(error.into())
    }

    /// The status code this error renders as when a response can still be
    /// written, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Parse(e) => Some(e.status()),
            Self::Status(e) => Some(e.code),
            Self::Overloaded => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::Timeout(cause) => Some(cause.status()),
            Self::Redirect(_) => Some(StatusCode::MOVED_PERMANENTLY),
            Self::IllegalHandlerState(_) | Self::Other(_) | Self::Io(_) | Self::Tls(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::AlreadyCompleted | Self::Disconnected => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => Display::fmt(e, f),
            Self::Parse(e) => Display::fmt(e, f),
            Self::Status(e) => Display::fmt(e, f),
            Self::Tls(e) => write!(f, "tls failure: {e}"),
            Self::Overloaded => f.write_str("rejected due to overload"),
            Self::Disconnected => f.write_str("client disconnected"),
            Self::Timeout(cause) => write!(f, "timed out: {cause:?}"),
            Self::Redirect(target) => write!(f, "redirect required: {target}"),
            Self::IllegalHandlerState(detail) => write!(f, "illegal handler state: {detail}"),
            Self::AlreadyCompleted => f.write_str("response already completed"),
            Self::Other(e) => Display::fmt(e, f),
        }
    }
}

impl StdError for Error {}

impl From<Infallible> for Error {
    #[inline]
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<IoError> for Error {
    #[inline]
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<ParseError> for Error {
    #[inline]
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<StatusError> for Error {
    #[inline]
    fn from(e: StatusError) -> Self {
        Self::Status(e)
    }
}

impl From<BoxedError> for Error {
    #[inline]
    fn from(e: BoxedError) -> Self {
        Self::Other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from() {
        let err: Error = IoError::other("oh no!").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = StatusError::bad_request().into();
        assert!(matches!(err, Error::Status(_)));

        let err = Error::other("custom error");
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            Error::Overloaded.status(),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(
            Error::Timeout(TimeoutCause::ResponseWrite).status(),
            Some(StatusCode::GATEWAY_TIMEOUT)
        );
        assert_eq!(Error::Disconnected.status(), None);
    }
}
