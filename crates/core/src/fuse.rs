//! Protecting connections from stalled peers.
//!
//! Each connection owns an [`ActivityFuse`]. The driver reports socket and
//! body-progress events; the fuse tracks three deadlines (idle, request body
//! read, response write) and resolves [`ActivityFuse::fused`] when one fires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::conf::ServerConfig;
use crate::error::TimeoutCause;

/// An activity report from the connection driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FuseEvent {
    /// Bytes moved on the socket in either direction.
    Alive,
    /// The exchange started waiting for request body bytes.
    AwaitingBody,
    /// Request body bytes arrived or the body finished.
    BodyProgress,
    /// A socket write was submitted.
    WriteStart,
    /// The pending socket write completed.
    WriteDone,
}

#[derive(Debug)]
struct FuseState {
    last_activity: Instant,
    awaiting_body_since: Option<Instant>,
    write_pending_since: Option<Instant>,
}

/// Deadline tracker for one connection.
#[derive(Debug)]
pub(crate) struct ActivityFuse {
    idle_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    state: Mutex<FuseState>,
    notify: Notify,
}

impl ActivityFuse {
    pub(crate) fn new(conf: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            idle_timeout: conf.idle_timeout,
            read_timeout: conf.request_read_timeout,
            write_timeout: conf.response_write_timeout,
            state: Mutex::new(FuseState {
                last_activity: Instant::now(),
                awaiting_body_since: None,
                write_pending_since: None,
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn event(&self, event: FuseEvent) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match event {
            FuseEvent::Alive => state.last_activity = now,
            FuseEvent::AwaitingBody => {
                state.awaiting_body_since.get_or_insert(now);
            }
            FuseEvent::BodyProgress => {
                state.awaiting_body_since = None;
                state.last_activity = now;
            }
            FuseEvent::WriteStart => {
                state.write_pending_since.get_or_insert(now);
            }
            FuseEvent::WriteDone => {
                state.write_pending_since = None;
                state.last_activity = now;
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn next_deadline(&self) -> (Instant, TimeoutCause) {
        let state = self.state.lock();
        let mut deadline = state.last_activity + self.idle_timeout;
        let mut cause = TimeoutCause::Idle;
        if let Some(since) = state.awaiting_body_since {
            let read_deadline = since + self.read_timeout;
            if read_deadline < deadline {
                deadline = read_deadline;
                cause = TimeoutCause::RequestRead;
            }
        }
        if let Some(since) = state.write_pending_since {
            let write_deadline = since + self.write_timeout;
            if write_deadline < deadline {
                deadline = write_deadline;
                cause = TimeoutCause::ResponseWrite;
            }
        }
        (deadline, cause)
    }

    /// Resolves when a deadline fires, with the cause that fired.
    pub(crate) async fn fused(&self) -> TimeoutCause {
        loop {
            let (deadline, cause) = self.next_deadline();
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    // An event may have slipped in between computing the
                    // deadline and the sleep expiring.
                    let (fresh, fresh_cause) = self.next_deadline();
                    if fresh <= Instant::now() {
                        return fresh_cause;
                    }
                }
                () = self.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_conf() -> ServerConfig {
        ServerConfig::new()
            .idle_timeout(Duration::from_millis(50))
            .request_read_timeout(Duration::from_millis(20))
            .response_write_timeout(Duration::from_millis(20))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_fires() {
        let fuse = ActivityFuse::new(&tiny_conf());
        assert_eq!(fuse.fused().await, TimeoutCause::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_beats_idle() {
        let fuse = ActivityFuse::new(&tiny_conf());
        fuse.event(FuseEvent::AwaitingBody);
        assert_eq!(fuse.fused().await, TimeoutCause::RequestRead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_idle() {
        let fuse = ActivityFuse::new(&tiny_conf());
        let ticker = {
            let fuse = Arc::clone(&fuse);
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    fuse.event(FuseEvent::Alive);
                }
            })
        };
        let fired = tokio::time::timeout(Duration::from_millis(120), fuse.fused()).await;
        assert!(fired.is_err(), "fuse must not fire while activity continues");
        ticker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_done_disarms() {
        let fuse = ActivityFuse::new(&tiny_conf());
        fuse.event(FuseEvent::WriteStart);
        fuse.event(FuseEvent::WriteDone);
        assert_eq!(fuse.fused().await, TimeoutCause::Idle);
    }
}
