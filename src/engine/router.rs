//! Routes decoded driver frames from the hub into the dispatch engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::rate_limiter::{LOCATION_UPDATE, RateLimitKey, RateLimiter};
use crate::geo::valid_coordinates;
use crate::hub::connection::InboundHandler;
use crate::hub::messages::{LocationUpdate, OutboundFrame, RideResponse};
use crate::hub::{DriverConnectionHub, SendOutcome};
use crate::models::driver::LocationSample;
use crate::models::ride::Location;
use crate::observability::metrics::Metrics;
use crate::ports::locator::DriverLocator;
use crate::ports::repository::DriverRepository;

pub struct DriverEventRouter {
    hub: Arc<DriverConnectionHub>,
    coordinator: Arc<DispatchCoordinator>,
    limiter: Arc<RateLimiter>,
    locator: Arc<dyn DriverLocator>,
    drivers: Arc<dyn DriverRepository>,
    /// hub session id -> persisted driver session id
    sessions: DashMap<Uuid, Uuid>,
    retry_after_ms: u64,
    metrics: Metrics,
}

impl DriverEventRouter {
    pub fn new(
        hub: Arc<DriverConnectionHub>,
        coordinator: Arc<DispatchCoordinator>,
        limiter: Arc<RateLimiter>,
        locator: Arc<dyn DriverLocator>,
        drivers: Arc<dyn DriverRepository>,
        metrics: Metrics,
    ) -> Self {
        let retry_after_ms = limiter.refill_period().as_millis() as u64;
        Self {
            hub,
            coordinator,
            limiter,
            locator,
            drivers,
            sessions: DashMap::new(),
            retry_after_ms,
            metrics,
        }
    }

    fn reply(&self, driver_id: Uuid, frame: OutboundFrame) {
        match self.hub.send_to_driver(driver_id, frame) {
            Ok(SendOutcome::Delivered | SendOutcome::NotConnected) => {}
            Err(err) => warn!(error = %err, "reply delivery failed"),
        }
    }
}

#[async_trait]
impl InboundHandler for DriverEventRouter {
    async fn on_connect(&self, driver_id: Uuid, session_id: Uuid) {
        match self.drivers.create_session(driver_id).await {
            Ok(stored) => {
                self.sessions.insert(session_id, stored);
            }
            Err(err) => warn!(driver_id = %driver_id, error = %err, "failed to record driver session"),
        }
    }

    async fn on_ride_response(&self, driver_id: Uuid, response: RideResponse) {
        let ride_id = response.ride_id;
        match self.coordinator.handle_response(driver_id, response).await {
            Ok(outcome) => {
                debug!(driver_id = %driver_id, ride_id = %ride_id, outcome = ?outcome, "ride response handled");
            }
            Err(err) => {
                warn!(driver_id = %driver_id, ride_id = %ride_id, error = %err, "ride response failed");
            }
        }
    }

    async fn on_location_update(&self, driver_id: Uuid, update: LocationUpdate) {
        if !valid_coordinates(update.latitude, update.longitude) {
            debug!(driver_id = %driver_id, "location out of range");
            self.reply(
                driver_id,
                OutboundFrame::error(
                    "invalid_location",
                    format!(
                        "coordinates out of range: {}, {}",
                        update.latitude, update.longitude
                    ),
                ),
            );
            return;
        }

        if !self.limiter.allow(RateLimitKey::new(driver_id, LOCATION_UPDATE), 1) {
            self.metrics
                .rate_limited_total
                .with_label_values(&[LOCATION_UPDATE])
                .inc();
            self.reply(
                driver_id,
                OutboundFrame::RateLimited {
                    operation: LOCATION_UPDATE.to_string(),
                    retry_after_ms: self.retry_after_ms,
                },
            );
            return;
        }

        let location = Location::new(update.latitude, update.longitude);
        if let Err(err) = self.locator.update_location(driver_id, location).await {
            warn!(driver_id = %driver_id, error = %err, "failed to update driver location");
            return;
        }

        let sample = LocationSample {
            driver_id,
            latitude: update.latitude,
            longitude: update.longitude,
            accuracy_meters: update.accuracy_meters,
            speed_kmh: update.speed_kmh,
            heading_degrees: update.heading_degrees,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.drivers.record_location(sample).await {
            warn!(driver_id = %driver_id, error = %err, "failed to record location history");
        }
    }

    async fn on_disconnect(&self, driver_id: Uuid, session_id: Uuid) {
        let Some((_, stored)) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Err(err) = self.drivers.end_session(stored).await {
            warn!(driver_id = %driver_id, error = %err, "failed to end driver session");
        }
    }
}
