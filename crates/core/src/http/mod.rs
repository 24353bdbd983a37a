//! Http module. Vocabulary types and the request/response models.

pub mod body;
pub(crate) mod date;
pub mod errors;
pub mod request;
pub mod response;

pub use body::{BodyMode, ReqBody};
pub use errors::{StatusError, StatusResult};
pub use http::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use http::method::Method;
pub use http::uri::{self, Scheme, Uri};
pub use http::version::Version;
pub use http::StatusCode;
pub use request::Request;
pub use response::Response;

/// Whether a response with this status never carries a body.
#[must_use]
pub fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Reads a header as a UTF-8 string, if present and valid.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Whether a comma separated header value contains the given token.
#[must_use]
pub fn header_contains_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forbids_body() {
        assert!(status_forbids_body(StatusCode::CONTINUE));
        assert!(status_forbids_body(StatusCode::NO_CONTENT));
        assert!(status_forbids_body(StatusCode::NOT_MODIFIED));
        assert!(!status_forbids_body(StatusCode::OK));
        assert!(!status_forbids_body(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_header_contains_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TE, "gzip, Trailers".parse().expect("value"));
        assert!(header_contains_token(&headers, header::TE, "trailers"));
        assert!(!header_contains_token(&headers, header::TE, "deflate"));
    }
}
