//! Server-wide counters and per-connection views.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::http::Version;

/// Process-wide counters.
///
/// All increments are relaxed atomics; [`ServerStats::snapshot`] reads are
/// eventually consistent.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) completed_requests: AtomicU64,
    pub(crate) active_requests: AtomicU64,
    pub(crate) invalid_http_requests: AtomicU64,
    pub(crate) rejected_due_to_overload: AtomicU64,
    pub(crate) failed_to_connect: AtomicU64,
    pub(crate) active_connections: AtomicU64,
}

/// A point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct StatsSnapshot {
    /// Total bytes read from sockets.
    pub bytes_read: u64,
    /// Total bytes written to sockets.
    pub bytes_sent: u64,
    /// Exchanges that reached `Complete`.
    pub completed_requests: u64,
    /// Exchanges currently in flight.
    pub active_requests: u64,
    /// Requests rejected for malformed wire data.
    pub invalid_http_requests: u64,
    /// Requests or streams refused for lack of capacity.
    pub rejected_due_to_overload: u64,
    /// Connections dropped before a request could start (TLS failures).
    pub failed_to_connect: u64,
    /// Connections currently open.
    pub active_connections: u64,
}

impl ServerStats {
    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_ended(&self, completed: bool) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        if completed {
            self.completed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn invalid_request(&self) {
        self.invalid_http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_overload(&self) {
        self.rejected_due_to_overload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect_failed(&self) {
        self.failed_to_connect.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            invalid_http_requests: self.invalid_http_requests.load(Ordering::Relaxed),
            rejected_due_to_overload: self.rejected_due_to_overload.load(Ordering::Relaxed),
            failed_to_connect: self.failed_to_connect.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Live per-connection counters shared between the driver and snapshots.
#[derive(Debug)]
pub(crate) struct ConnectionMonitor {
    pub(crate) protocol: Version,
    pub(crate) cipher: Option<String>,
    pub(crate) tls_protocol: Option<String>,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) started_at: SystemTime,
    pub(crate) completed_requests: AtomicU64,
    pub(crate) active_requests: AtomicU64,
}

/// A snapshot view of one open connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionView {
    /// Negotiated HTTP protocol.
    pub protocol: Version,
    /// Negotiated cipher suite, if the connection is TLS.
    pub cipher: Option<String>,
    /// Negotiated TLS protocol version, if the connection is TLS.
    pub tls_protocol: Option<String>,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// When the connection was accepted.
    pub started_at: SystemTime,
    /// Exchanges completed on this connection.
    pub completed_requests: u64,
    /// Exchanges in flight on this connection.
    pub active_requests: u64,
}

/// Registry of open connections backing `active_connections()` snapshots.
#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, Arc<ConnectionMonitor>>>,
}

impl ConnectionRegistry {
    pub(crate) fn register(&self, monitor: Arc<ConnectionMonitor>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, monitor);
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    pub(crate) fn views(&self) -> Vec<ConnectionView> {
        self.inner
            .lock()
            .values()
            .map(|m| ConnectionView {
                protocol: m.protocol,
                cipher: m.cipher.clone(),
                tls_protocol: m.tls_protocol.clone(),
                remote_addr: m.remote_addr,
                started_at: m.started_at,
                completed_requests: m.completed_requests.load(Ordering::Relaxed),
                active_requests: m.active_requests.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roundtrip() {
        let stats = ServerStats::default();
        stats.add_bytes_read(10);
        stats.add_bytes_sent(20);
        stats.request_started();
        stats.request_ended(true);
        stats.invalid_request();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 10);
        assert_eq!(snap.bytes_sent, 20);
        assert_eq!(snap.completed_requests, 1);
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.invalid_http_requests, 1);
    }

    #[test]
    fn test_registry_snapshot() {
        let registry = ConnectionRegistry::default();
        let monitor = Arc::new(ConnectionMonitor {
            protocol: Version::HTTP_11,
            cipher: None,
            tls_protocol: None,
            remote_addr: "127.0.0.1:9999".parse().expect("addr"),
            started_at: SystemTime::now(),
            completed_requests: AtomicU64::new(3),
            active_requests: AtomicU64::new(1),
        });
        let id = registry.register(monitor);
        let views = registry.views();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].completed_requests, 3);
        registry.deregister(id);
        assert!(registry.views().is_empty());
    }
}
