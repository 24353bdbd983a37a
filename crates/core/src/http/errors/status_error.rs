use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

use crate::http::StatusCode;

/// Result type with `StatusError` as its error type.
pub type StatusResult<T> = Result<T, StatusError>;

/// Reason phrases and one-line summaries for the statuses this engine emits
/// on its own. Everything else falls back to the status code's canonical
/// reason with no summary.
const CANNED: &[(StatusCode, &str)] = &[
    (
        StatusCode::BAD_REQUEST,
        "The request could not be understood by the server due to malformed syntax.",
    ),
    (
        StatusCode::NOT_FOUND,
        "The requested resource could not be found.",
    ),
    (
        StatusCode::METHOD_NOT_ALLOWED,
        "The request method is not supported for the requested resource.",
    ),
    (
        StatusCode::REQUEST_TIMEOUT,
        "The server timed out waiting for the request.",
    ),
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        "The request is larger than the server is willing or able to process.",
    ),
    (
        StatusCode::URI_TOO_LONG,
        "The URI provided was too long for the server to process.",
    ),
    (
        StatusCode::EXPECTATION_FAILED,
        "The server cannot meet the requirements of the expect request-header field.",
    ),
    (
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        "The server is unwilling to process the request because its header fields are too large.",
    ),
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "The server encountered an internal error while processing this request.",
    ),
    (
        StatusCode::NOT_IMPLEMENTED,
        "The server either does not recognize the request method, or it lacks the ability to fulfill the request.",
    ),
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "The server is currently unavailable.",
    ),
    (
        StatusCode::GATEWAY_TIMEOUT,
        "The server did not receive a timely response from an upstream server.",
    ),
    (
        StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        "The server does not support the major version of HTTP that was used in the request message.",
    ),
];

/// HTTP status error information.
///
/// Carries the status code plus human readable pieces used when rendering the
/// default error page.
#[derive(Debug)]
#[non_exhaustive]
pub struct StatusError {
    /// Http error status code.
    pub code: StatusCode,
    /// Http error name.
    pub name: String,
    /// Brief information about the error.
    pub brief: String,
    /// Detail information about the error.
    pub detail: Option<String>,
    /// Underlying cause, if any.
    pub cause: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl StatusError {
    fn canned(code: StatusCode) -> Self {
        let brief = CANNED
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, brief)| (*brief).to_owned())
            .unwrap_or_default();
        Self {
            code,
            name: code.canonical_reason().unwrap_or("Unknown Error").to_owned(),
            brief,
            detail: None,
            cause: None,
        }
    }

    /// Sets brief field and returns `Self`.
    #[must_use]
    pub fn brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }

    /// Sets detail field and returns `Self`.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets cause field and returns `Self`.
    #[must_use]
    pub fn cause<T>(mut self, cause: T) -> Self
    where
        T: Into<Box<dyn StdError + Sync + Send + 'static>>,
    {
        self.cause = Some(cause.into());
        self
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request() -> Self {
        Self::canned(StatusCode::BAD_REQUEST)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found() -> Self {
        Self::canned(StatusCode::NOT_FOUND)
    }

    /// 405 Method Not Allowed.
    #[must_use]
    pub fn method_not_allowed() -> Self {
        Self::canned(StatusCode::METHOD_NOT_ALLOWED)
    }

    /// 408 Request Timeout.
    #[must_use]
    pub fn request_timeout() -> Self {
        Self::canned(StatusCode::REQUEST_TIMEOUT)
    }

    /// 413 Payload Too Large.
    #[must_use]
    pub fn payload_too_large() -> Self {
        Self::canned(StatusCode::PAYLOAD_TOO_LARGE)
    }

    /// 414 URI Too Long.
    #[must_use]
    pub fn uri_too_long() -> Self {
        Self::canned(StatusCode::URI_TOO_LONG)
    }

    /// 417 Expectation Failed.
    #[must_use]
    pub fn expectation_failed() -> Self {
        Self::canned(StatusCode::EXPECTATION_FAILED)
    }

    /// 431 Request Header Fields Too Large.
    #[must_use]
    pub fn request_header_fields_too_large() -> Self {
        Self::canned(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal_server_error() -> Self {
        Self::canned(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// 501 Not Implemented.
    #[must_use]
    pub fn not_implemented() -> Self {
        Self::canned(StatusCode::NOT_IMPLEMENTED)
    }

    /// 503 Service Unavailable.
    #[must_use]
    pub fn service_unavailable() -> Self {
        Self::canned(StatusCode::SERVICE_UNAVAILABLE)
    }

    /// 504 Gateway Timeout.
    #[must_use]
    pub fn gateway_timeout() -> Self {
        Self::canned(StatusCode::GATEWAY_TIMEOUT)
    }

    /// 505 HTTP Version Not Supported.
    #[must_use]
    pub fn http_version_not_supported() -> Self {
        Self::canned(StatusCode::HTTP_VERSION_NOT_SUPPORTED)
    }

    /// Create new `StatusError` with code. If code is not a client or server
    /// error, returns `None`.
    #[must_use]
    pub fn from_code(code: StatusCode) -> Option<Self> {
        if code.is_client_error() || code.is_server_error() {
            Some(Self::canned(code))
        } else {
            None
        }
    }
}

impl StdError for StatusError {}

impl Display for StatusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code.as_u16(), self.name)?;
        if !self.brief.is_empty() {
            write!(f, ": {}", self.brief)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code() {
        assert_eq!(
            StatusError::from_code(StatusCode::URI_TOO_LONG).map(|e| e.code),
            Some(StatusCode::URI_TOO_LONG)
        );
        assert!(StatusError::from_code(StatusCode::OK).is_none());
        let odd = StatusError::from_code(StatusCode::IM_A_TEAPOT).expect("client error");
        assert_eq!(odd.name, "I'm a teapot");
        assert!(odd.brief.is_empty(), "unlisted codes carry no summary");
    }

    #[test]
    fn test_canned_matches_constructor() {
        let via_code = StatusError::from_code(StatusCode::URI_TOO_LONG).expect("error");
        let direct = StatusError::uri_too_long();
        assert_eq!(via_code.name, direct.name);
        assert_eq!(via_code.brief, direct.brief);
    }

    #[test]
    fn test_display() {
        let err = StatusError::uri_too_long().detail("8176 bytes");
        let text = format!("{err}");
        assert!(text.starts_with("414 URI Too Long"), "got: {text}");
        assert!(text.contains("(8176 bytes)"));

        let err = StatusError::bad_request().cause(std::io::Error::other("boom"));
        let text = format!("{err}");
        assert!(text.contains("caused by: boom"));
    }
}
