//! Live driver sessions and best-effort delivery to them.
//!
//! The driver -> session table is the only state here shared between
//! tasks. It sits behind one read-mostly lock; sends only take the read
//! side and never wait on a peer.

pub mod connection;
pub mod messages;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::messages::OutboundFrame;
use crate::hub::session::{Activity, DriverSession, SessionLease};
use crate::observability::metrics::Metrics;

/// Result of a send that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The driver has no live session. Expected, not an error.
    NotConnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct DriverConnectionHub {
    sessions: RwLock<HashMap<Uuid, DriverSession>>,
    config: HubConfig,
    metrics: Metrics,
}

impl DriverConnectionHub {
    pub fn new(config: HubConfig, metrics: Metrics) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers an authenticated session, closing any prior session for
    /// the same driver.
    pub fn register(&self, driver_id: Uuid) -> SessionLease {
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let shutdown = CancellationToken::new();
        let activity = Arc::new(Activity::new());
        let session_id = Uuid::new_v4();

        let session = DriverSession {
            driver_id,
            session_id,
            connected_at: Utc::now(),
            outbound,
            shutdown: shutdown.clone(),
            activity: activity.clone(),
        };

        let (previous, live) = {
            let mut sessions = self.sessions.write();
            let previous = sessions.insert(driver_id, session);
            (previous, sessions.len())
        };
        self.metrics.connected_drivers.set(live as i64);

        if let Some(previous) = previous {
            info!(
                driver_id = %driver_id,
                replaced_session = %previous.session_id,
                "driver reconnected; closing previous session"
            );
            previous.close();
        }

        info!(driver_id = %driver_id, session_id = %session_id, "driver session registered");

        SessionLease {
            driver_id,
            session_id,
            outbound_rx,
            shutdown,
            activity,
        }
    }

    /// Removes the session if it is still the live one for the driver.
    pub fn unregister(&self, driver_id: Uuid, session_id: Uuid) -> bool {
        let (removed, live) = {
            let mut sessions = self.sessions.write();
            let removed = match sessions.get(&driver_id) {
                Some(session) if session.session_id == session_id => sessions.remove(&driver_id),
                _ => None,
            };
            (removed, sessions.len())
        };

        match removed {
            Some(session) => {
                session.close();
                self.metrics.connected_drivers.set(live as i64);
                info!(driver_id = %driver_id, session_id = %session_id, "driver session closed");
                true
            }
            None => false,
        }
    }

    /// Non-blocking send. A full queue means the peer is not draining; the
    /// session is torn down and the driver has to reconnect.
    pub fn send_to_driver(
        &self,
        driver_id: Uuid,
        frame: OutboundFrame,
    ) -> Result<SendOutcome, HubError> {
        let (session_id, result) = {
            let sessions = self.sessions.read();
            match sessions.get(&driver_id) {
                Some(session) => (session.session_id, session.outbound.try_send(frame)),
                None => return Ok(SendOutcome::NotConnected),
            }
        };

        match result {
            Ok(()) => Ok(SendOutcome::Delivered),
            Err(TrySendError::Full(_)) => {
                warn!(driver_id = %driver_id, "outbound queue full; evicting slow driver");
                self.unregister(driver_id, session_id);
                Err(HubError::DeliveryFailed { driver_id })
            }
            Err(TrySendError::Closed(_)) => {
                warn!(driver_id = %driver_id, "outbound queue closed; evicting driver");
                self.unregister(driver_id, session_id);
                Err(HubError::DeliveryFailed { driver_id })
            }
        }
    }

    /// Fans `frame` out to every live session. Failures are counted, not
    /// propagated.
    pub fn broadcast(&self, frame: &OutboundFrame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for driver_id in self.connected_drivers() {
            match self.send_to_driver(driver_id, frame.clone()) {
                Ok(SendOutcome::Delivered) => report.delivered += 1,
                Ok(SendOutcome::NotConnected) => {}
                Err(err) => {
                    debug!(error = %err, "broadcast recipient dropped");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn is_connected(&self, driver_id: Uuid) -> bool {
        self.sessions.read().contains_key(&driver_id)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn connected_drivers(&self) -> Vec<Uuid> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn close_all(&self) {
        let drained: Vec<DriverSession> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        self.metrics.connected_drivers.set(0);
        info!(closed = drained.len(), "closed all driver sessions");
    }

    /// Evicts sessions that have been silent longer than the liveness
    /// timeout.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let stale: Vec<(Uuid, Uuid)> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.activity.idle_for(now) > self.config.liveness_timeout)
            .map(|session| (session.driver_id, session.session_id))
            .collect();

        let mut reaped = 0;
        for (driver_id, session_id) in stale {
            if self.unregister(driver_id, session_id) {
                warn!(driver_id = %driver_id, "reaped unresponsive driver session");
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_reaper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reap_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reap_idle(Instant::now());
            }
        })
    }
}
