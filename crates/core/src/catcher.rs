//! Default error rendering.

use bytes::Bytes;

use crate::exchange::ResponseMeta;
use crate::http::{header, HeaderValue, StatusError, Version};

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// The minimal HTML failure page used when no handler produced a response.
#[must_use]
pub fn error_page(error: &StatusError) -> String {
    let reason = escape_html(&error.name);
    let detail = error
        .detail
        .as_deref()
        .map(escape_html)
        .unwrap_or_else(|| escape_html(&error.brief));
    format!(
        "<h1>{} {}</h1><p>{}</p>",
        error.code.as_str(),
        reason,
        detail
    )
}

/// Builds a complete HTML error response ready for a writer.
pub(crate) fn html_response(error: &StatusError, version: Version) -> (ResponseMeta, Bytes) {
    let mut meta = ResponseMeta::new(version);
    meta.status = Some(error.code);
    meta.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html;charset=utf-8"),
    );
    (meta, Bytes::from(error_page(error)))
}

/// Builds the canned plain-text response used for wire-level failures, where
/// the connection is torn down right after.
pub(crate) fn plain_response(error: &StatusError, version: Version) -> (ResponseMeta, Bytes) {
    let mut meta = ResponseMeta::new(version);
    meta.status = Some(error.code);
    meta.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain;charset=utf-8"),
    );
    let body = format!(
        "{} {} - {}",
        error.code.as_str(),
        error.name,
        error.detail.as_deref().unwrap_or(&error.brief)
    );
    (meta, Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_page_shape() {
        let page = error_page(&StatusError::not_found());
        assert_eq!(
            page,
            "<h1>404 Not Found</h1><p>The requested resource could not be found.</p>"
        );
    }

    #[test]
    fn test_detail_is_escaped() {
        let page = error_page(&StatusError::bad_request().detail("<script>x</script>"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn test_plain_response_content_type() {
        let (meta, body) = plain_response(&StatusError::uri_too_long(), Version::HTTP_11);
        assert_eq!(meta.status.map(|s| s.as_u16()), Some(414));
        assert_eq!(
            meta.headers.get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain;charset=utf-8"))
        );
        assert!(body.starts_with(b"414 URI Too Long"));
    }
}
