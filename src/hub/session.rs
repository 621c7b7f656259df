use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hub::messages::OutboundFrame;

/// Lifecycle of one driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AuthPending,
    Authenticated,
    Closed,
}

/// Last time anything was read from the peer.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        self.last_seen_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last_seen = self.origin + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last_seen)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// The hub-side record of a live, authenticated driver connection.
pub struct DriverSession {
    pub driver_id: Uuid,
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub(crate) outbound: mpsc::Sender<OutboundFrame>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) activity: Arc<Activity>,
}

impl DriverSession {
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }
}

/// What the connection task receives on registration: the private end of
/// its outbound queue and the signal telling it to stop.
pub struct SessionLease {
    pub driver_id: Uuid,
    pub session_id: Uuid,
    pub outbound_rx: mpsc::Receiver<OutboundFrame>,
    pub shutdown: CancellationToken,
    pub activity: Arc<Activity>,
}
