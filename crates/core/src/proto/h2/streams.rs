//! Per-connection stream table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::exchange::{ExchangeCtx, WriteOp};
use crate::http::body::{BodyEvent, BodySender};
use crate::http::HeaderMap;

use super::flow::FlowWindow;

/// RFC 7540 §5.1 state, collapsed to what a push-less server observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// Both sides may still send.
    Open,
    /// The client sent END_STREAM; the response is still in flight.
    HalfClosedRemote,
    /// We sent END_STREAM first and still accept request body frames.
    HalfClosedLocal,
    /// Both directions finished or the stream was reset.
    Closed,
}

/// One active stream and its exchange plumbing.
pub(crate) struct StreamEntry {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    pub(crate) exchange: Arc<ExchangeCtx>,
    /// Response ops produced by the stream's exchange task.
    pub(crate) ops_rx: mpsc::Receiver<WriteOp>,
    /// Flow credit released by the body consumer.
    pub(crate) credit_rx: mpsc::UnboundedReceiver<u32>,
    /// Body frames awaiting room in the consumer channel. Bounded in bytes
    /// by the stream receive window, since the peer cannot exceed it.
    pub(crate) inbound: VecDeque<BodyEvent>,
    pub(crate) body_tx: Option<BodySender>,
    pub(crate) recv_window: FlowWindow,
    pub(crate) send_window: FlowWindow,
    /// DATA payloads waiting for send-window credit.
    pub(crate) pending_out: VecDeque<Bytes>,
    /// Trailers to emit once pending data flushes; `Some` once the response
    /// body is complete.
    pub(crate) pending_end: Option<HeaderMap>,
    pub(crate) response_headers_sent: bool,
    pub(crate) response_ended: bool,
    /// The client sent `TE: trailers`.
    pub(crate) allow_trailers: bool,
    pub(crate) head_request: bool,
    pub(crate) body_bytes_seen: u64,
}

impl StreamEntry {
    /// Moves queued inbound body frames into the consumer channel while it
    /// has room. Returns `false` when the consumer is gone.
    pub(crate) fn flush_inbound(&mut self) -> bool {
        let Some(tx) = &self.body_tx else {
            self.inbound.clear();
            return false;
        };
        while let Some(event) = self.inbound.pop_front() {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.inbound.push_front(event);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.inbound.clear();
                    self.body_tx = None;
                    return false;
                }
            }
        }
        if self.remote_done() && self.inbound.is_empty() {
            self.body_tx = None;
        }
        true
    }

    fn remote_done(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        )
    }

    pub(crate) fn both_sides_done(&self) -> bool {
        self.response_ended && self.remote_done()
    }
}

/// Work surfaced by polling the per-stream channels.
pub(crate) enum StreamWork {
    Op(u32, WriteOp),
    Credit(u32, u32),
}

/// Integer-keyed table of live streams.
#[derive(Default)]
pub(crate) struct StreamTable {
    entries: HashMap<u32, StreamEntry>,
    pub(crate) highest_seen: u32,
    pub(crate) last_processed: u32,
}

impl StreamTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut StreamEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, entry: StreamEntry) {
        self.highest_seen = self.highest_seen.max(entry.id);
        self.last_processed = self.last_processed.max(entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<StreamEntry> {
        self.entries.remove(&id)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamEntry> {
        self.entries.values_mut()
    }

    /// Purges streams that are closed on both sides.
    pub(crate) fn purge_closed(&mut self) -> Vec<StreamEntry> {
        let done: Vec<u32> = self
            .entries
            .values()
            .filter(|s| s.state == StreamState::Closed)
            .map(|s| s.id)
            .collect();
        done.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Polls every stream's op and credit channels for work. Registers
    /// wakers on all pending channels, so a later message wakes the driver.
    pub(crate) fn poll_work(&mut self, cx: &mut Context<'_>) -> Poll<StreamWork> {
        for stream in self.entries.values_mut() {
            if let Poll::Ready(Some(op)) = stream.ops_rx.poll_recv(cx) {
                return Poll::Ready(StreamWork::Op(stream.id, op));
            }
            if let Poll::Ready(Some(credit)) = stream.credit_rx.poll_recv(cx) {
                return Poll::Ready(StreamWork::Credit(stream.id, credit));
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::exchange::ops_channel;
    use crate::http::body::body_channel;
    use crate::http::Version;
    use crate::proto::h2::frame::DEFAULT_INITIAL_WINDOW;

    fn entry(id: u32) -> (StreamEntry, mpsc::Receiver<BodyEvent>) {
        let (ops_tx, ops_rx) = ops_channel();
        let (_credit_tx, credit_rx) = mpsc::unbounded_channel();
        let (body_tx, body_rx) = body_channel();
        let exchange = ExchangeCtx::new(Version::HTTP_2, ops_tx, CancellationToken::new());
        (
            StreamEntry {
                id,
                state: StreamState::Open,
                exchange,
                ops_rx,
                credit_rx,
                inbound: VecDeque::new(),
                body_tx: Some(body_tx),
                recv_window: FlowWindow::new(DEFAULT_INITIAL_WINDOW),
                send_window: FlowWindow::new(DEFAULT_INITIAL_WINDOW),
                pending_out: VecDeque::new(),
                pending_end: None,
                response_headers_sent: false,
                response_ended: false,
                allow_trailers: false,
                head_request: false,
                body_bytes_seen: 0,
            },
            body_rx,
        )
    }

    #[tokio::test]
    async fn test_flush_inbound_respects_capacity() {
        let (mut stream, mut body_rx) = entry(1);
        stream.inbound.push_back(BodyEvent::Data(Bytes::from_static(b"a")));
        stream.inbound.push_back(BodyEvent::Data(Bytes::from_static(b"b")));
        assert!(stream.flush_inbound());
        // Channel capacity is one: the second frame stays queued.
        assert_eq!(stream.inbound.len(), 1);
        assert!(matches!(body_rx.recv().await, Some(BodyEvent::Data(_))));
        assert!(stream.flush_inbound());
        assert!(stream.inbound.is_empty());
    }

    #[tokio::test]
    async fn test_flush_detects_dropped_consumer() {
        let (mut stream, body_rx) = entry(1);
        drop(body_rx);
        stream.inbound.push_back(BodyEvent::Data(Bytes::from_static(b"a")));
        assert!(!stream.flush_inbound());
        assert!(stream.body_tx.is_none());
    }

    #[tokio::test]
    async fn test_purge_closed() {
        let mut table = StreamTable::default();
        let (mut a, _rx_a) = entry(1);
        a.state = StreamState::Closed;
        let (b, _rx_b) = entry(3);
        table.insert(a);
        table.insert(b);
        assert_eq!(table.len(), 2);
        let purged = table.purge_closed();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.highest_seen, 3);
    }
}
