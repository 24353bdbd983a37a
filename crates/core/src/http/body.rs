//! Request and response body plumbing.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::http::HeaderMap;
use crate::{Error, TimeoutCause};

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyMode {
    /// No body follows the headers.
    #[default]
    None,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// The body extends to end of stream (responses only).
    Unspecified,
}

impl BodyMode {
    /// Whether any body bytes follow the headers.
    #[must_use]
    pub fn has_body(&self) -> bool {
        !matches!(self, Self::None) && !matches!(self, Self::Fixed(0))
    }
}

/// Why an in-flight body ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyError {
    Disconnected,
    TimedOut,
    TooLarge,
}

impl From<BodyError> for Error {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Disconnected => Error::Disconnected,
            BodyError::TimedOut => Error::Timeout(TimeoutCause::RequestRead),
            BodyError::TooLarge => Error::Status(crate::http::StatusError::payload_too_large()),
        }
    }
}

/// One frame delivered from the connection driver to the body consumer.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    Data(Bytes),
    Trailers(HeaderMap),
    End,
    Error(BodyError),
}

/// Sender half handed to the connection driver.
pub(crate) type BodySender = mpsc::Sender<BodyEvent>;

/// Creates the body channel pair.
///
/// Capacity one: the driver can park at most one undelivered frame, which is
/// what hands backpressure to the socket read loop and, for HTTP/2, holds
/// back `WINDOW_UPDATE` until the consumer drains.
pub(crate) fn body_channel() -> (BodySender, mpsc::Receiver<BodyEvent>) {
    mpsc::channel(1)
}

/// Streaming request body.
///
/// Chunks are handed out in strict arrival order; consuming a chunk releases
/// inbound flow-control credit via `credit_tx`.
#[derive(Debug, Default)]
pub struct ReqBody {
    inner: ReqBodyInner,
}

#[derive(Debug, Default)]
enum ReqBodyInner {
    /// The request carries no body.
    #[default]
    None,
    Stream {
        rx: mpsc::Receiver<BodyEvent>,
        credit_tx: Option<mpsc::UnboundedSender<u32>>,
        trailers: Option<HeaderMap>,
        ended: bool,
        failed: Option<BodyError>,
    },
}

impl ReqBody {
    pub(crate) fn none() -> Self {
        Self {
            inner: ReqBodyInner::None,
        }
    }

    pub(crate) fn stream(
        rx: mpsc::Receiver<BodyEvent>,
        credit_tx: Option<mpsc::UnboundedSender<u32>>,
    ) -> Self {
        Self {
            inner: ReqBodyInner::Stream {
                rx,
                credit_tx,
                trailers: None,
                ended: false,
                failed: None,
            },
        }
    }

    /// Whether the body has been read to the end.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        match &self.inner {
            ReqBodyInner::None => true,
            ReqBodyInner::Stream { ended, .. } => *ended,
        }
    }

    /// Trailer fields received after the last chunk, if any.
    #[must_use]
    pub fn trailers(&self) -> Option<&HeaderMap> {
        match &self.inner {
            ReqBodyInner::None => None,
            ReqBodyInner::Stream { trailers, .. } => trailers.as_ref(),
        }
    }

    /// Receives the next body chunk, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> crate::Result<Option<Bytes>> {
        match &mut self.inner {
            ReqBodyInner::None => Ok(None),
            ReqBodyInner::Stream {
                rx,
                credit_tx,
                trailers,
                ended,
                failed,
            } => {
                if let Some(err) = *failed {
                    return Err(err.into());
                }
                if *ended {
                    return Ok(None);
                }
                loop {
                    match rx.recv().await {
                        Some(BodyEvent::Data(data)) => {
                            if let Some(credit_tx) = credit_tx {
                                let _ = credit_tx.send(data.len() as u32);
                            }
                            return Ok(Some(data));
                        }
                        Some(BodyEvent::Trailers(fields)) => {
                            *trailers = Some(fields);
                        }
                        Some(BodyEvent::End) | None => {
                            *ended = true;
                            return Ok(None);
                        }
                        Some(BodyEvent::Error(err)) => {
                            *failed = Some(err);
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_mode() {
        assert!(!BodyMode::None.has_body());
        assert!(!BodyMode::Fixed(0).has_body());
        assert!(BodyMode::Fixed(1).has_body());
        assert!(BodyMode::Chunked.has_body());
    }

    #[tokio::test]
    async fn test_stream_in_order_with_credit() {
        let (tx, rx) = body_channel();
        let (credit_tx, mut credit_rx) = mpsc::unbounded_channel();
        let mut body = ReqBody::stream(rx, Some(credit_tx));

        tokio::spawn(async move {
            tx.send(BodyEvent::Data(Bytes::from_static(b"ab"))).await.ok();
            tx.send(BodyEvent::Data(Bytes::from_static(b"cde"))).await.ok();
            tx.send(BodyEvent::End).await.ok();
        });

        assert_eq!(body.next_chunk().await.expect("chunk"), Some(Bytes::from_static(b"ab")));
        assert_eq!(credit_rx.recv().await, Some(2));
        assert_eq!(body.next_chunk().await.expect("chunk"), Some(Bytes::from_static(b"cde")));
        assert_eq!(credit_rx.recv().await, Some(3));
        assert_eq!(body.next_chunk().await.expect("end"), None);
        assert!(body.is_ended());
        // Reading past the end stays at the end.
        assert_eq!(body.next_chunk().await.expect("end"), None);
    }

    #[tokio::test]
    async fn test_trailers_surface_before_end() {
        let (tx, rx) = body_channel();
        let mut body = ReqBody::stream(rx, None);
        let mut fields = HeaderMap::new();
        fields.insert("x-checksum", "abc".parse().expect("value"));
        tokio::spawn(async move {
            tx.send(BodyEvent::Data(Bytes::from_static(b"x"))).await.ok();
            tx.send(BodyEvent::Trailers(fields)).await.ok();
            tx.send(BodyEvent::End).await.ok();
        });
        assert!(body.next_chunk().await.expect("chunk").is_some());
        assert_eq!(body.next_chunk().await.expect("end"), None);
        assert_eq!(
            body.trailers().and_then(|t| t.get("x-checksum")),
            Some(&"abc".parse().expect("value"))
        );
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let (tx, rx) = body_channel();
        let mut body = ReqBody::stream(rx, None);
        tx.send(BodyEvent::Error(BodyError::Disconnected)).await.ok();
        assert!(matches!(
            body.next_chunk().await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            body.next_chunk().await,
            Err(Error::Disconnected)
        ));
    }
}
