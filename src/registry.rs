//! Live session set used to coordinate server shutdown.

use axum::extract::ws::{close_code, CloseFrame, Utf8Bytes};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Close frame sent to a client when the server ends its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub fn frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.code,
            reason: Utf8Bytes::from_static(self.reason),
        }
    }
}

pub const SERVER_SHUTDOWN: CloseReason = CloseReason {
    code: close_code::AWAY,
    reason: "Server shutdown",
};

struct Entry {
    shutdown: Option<oneshot::Sender<CloseReason>>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    next_id: AtomicU64,
    closing: AtomicBool,
    live: watch::Sender<usize>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            live,
        }
    }

    /// Adds a session to the live set. Returns `None` once shutdown has begun.
    pub fn register(self: &Arc<Self>) -> Option<Registration> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut sessions = self.sessions.lock();
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }
        sessions.insert(
            id,
            Entry {
                shutdown: Some(shutdown_tx),
            },
        );
        self.live.send_replace(sessions.len());
        drop(sessions);

        Some(Registration {
            id,
            shutdown_rx: Some(shutdown_rx),
            registry: Arc::clone(self),
            registered: true,
        })
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub fn deregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock();
        let removed = sessions.remove(&id).is_some();
        if removed {
            self.live.send_replace(sessions.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Asks every live session to close with `reason`, then waits up to
    /// `grace` for all of them to deregister. Sessions still present after
    /// `grace` are dropped from the set. Returns how many sessions were asked
    /// to close.
    pub async fn broadcast_shutdown(&self, reason: CloseReason, grace: Duration) -> usize {
        let signals: Vec<oneshot::Sender<CloseReason>> = {
            let mut sessions = self.sessions.lock();
            self.closing.store(true, Ordering::SeqCst);
            sessions
                .values_mut()
                .filter_map(|entry| entry.shutdown.take())
                .collect()
        };

        let notified = signals.len();
        tracing::info!("Closing {} live sessions", notified);
        for signal in signals {
            let _ = signal.send(reason.clone());
        }

        let mut live = self.live.subscribe();
        let drained = tokio::time::timeout(grace, live.wait_for(|count| *count == 0))
            .await
            .is_ok();

        if !drained {
            let mut sessions = self.sessions.lock();
            tracing::warn!(
                "{} sessions did not close within {:?}, dropping them",
                sessions.len(),
                grace
            );
            sessions.clear();
            self.live.send_replace(0);
        }

        notified
    }
}

/// Membership of one session in the registry.
///
/// Dropping it deregisters the session, so a panicking session task still
/// leaves the live set.
pub struct Registration {
    id: SessionId,
    shutdown_rx: Option<oneshot::Receiver<CloseReason>>,
    registry: Arc<SessionRegistry>,
    registered: bool,
}

impl Registration {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Receiver resolved when the server asks this session to close.
    pub fn take_shutdown(&mut self) -> Option<oneshot::Receiver<CloseReason>> {
        self.shutdown_rx.take()
    }

    pub fn deregister(&mut self) {
        if std::mem::take(&mut self.registered) {
            self.registry.deregister(self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.deregister();
    }
}
