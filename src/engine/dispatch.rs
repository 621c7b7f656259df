//! Dispatch cycles: candidate selection, offer fan-out, and the race
//! between acceptances, declines, cancellation and the cycle timer.
//!
//! The coordinator talks to drivers only through the hub's send contract.
//! Driver responses reach it through [`DispatchCoordinator::handle_response`],
//! called from the responding driver's connection task.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::pending::{ClaimError, ClosedRide, DeclineOutcome, PendingOffers, Resolution};
use crate::engine::ranking::driver_earnings;
use crate::engine::state_machine::RideStateMachine;
use crate::error::{DispatchError, RepositoryError};
use crate::hub::messages::{
    OutboundFrame, RetractionReason, RideDetailsFrame, RideOfferFrame, RideResponse,
};
use crate::hub::{DriverConnectionHub, SendOutcome};
use crate::models::driver::{DriverStatus, DriverStatusEvent};
use crate::models::offer::RideOffer;
use crate::models::outcome::{DriverMatchOutcome, MatchRequest, RideStatusUpdate, UnmatchedReason};
use crate::models::ride::{Ride, RideStatus};
use crate::observability::metrics::Metrics;
use crate::ports::broker::{
    DISPATCH_EXCHANGE, MessageBroker, driver_response_key, driver_status_key, publish_json,
};
use crate::ports::locator::{DriverLocator, NearbyQuery};
use crate::ports::repository::{DriverRepository, RideChange, RideMutation, RideRepository};

/// External collaborators the coordinator depends on.
#[derive(Clone)]
pub struct DispatchPorts {
    pub locator: Arc<dyn DriverLocator>,
    pub rides: Arc<dyn RideRepository>,
    pub drivers: Arc<dyn DriverRepository>,
    pub broker: Arc<dyn MessageBroker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Matched { driver_id: Uuid },
    Unmatched(UnmatchedReason),
    /// The ride was not REQUESTED, or a cycle for it was already running.
    Skipped,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Matched { .. } => "matched",
            CycleOutcome::Unmatched(UnmatchedReason::NoDriversAvailable) => "no_drivers",
            CycleOutcome::Unmatched(UnmatchedReason::Timeout) => "timeout",
            CycleOutcome::Unmatched(UnmatchedReason::AllDeclined) => "declined",
            CycleOutcome::Unmatched(UnmatchedReason::RideCancelled) => "cancelled",
            CycleOutcome::Unmatched(UnmatchedReason::DispatchFailed) => "error",
            CycleOutcome::Skipped => "skipped",
        }
    }
}

/// What happened to one `ride_response` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Accepted,
    Declined,
    Rejected(RetractionReason),
}

pub struct DispatchCoordinator {
    hub: Arc<DriverConnectionHub>,
    ports: DispatchPorts,
    pending: PendingOffers,
    config: DispatchConfig,
    metrics: Metrics,
    match_tx: mpsc::Sender<MatchRequest>,
}

impl DispatchCoordinator {
    pub fn new(
        hub: Arc<DriverConnectionHub>,
        ports: DispatchPorts,
        config: DispatchConfig,
        metrics: Metrics,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<MatchRequest>) {
        let (match_tx, match_rx) = mpsc::channel(queue_size.max(1));
        (
            Self {
                hub,
                ports,
                pending: PendingOffers::new(),
                config,
                metrics,
                match_tx,
            },
            match_rx,
        )
    }

    pub fn pending(&self) -> &PendingOffers {
        &self.pending
    }

    pub(crate) fn match_sender(&self) -> &mpsc::Sender<MatchRequest> {
        &self.match_tx
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Drains the match queue, one task per dispatch cycle.
    pub async fn run(self: Arc<Self>, mut match_rx: mpsc::Receiver<MatchRequest>) {
        info!("dispatch coordinator started");

        while let Some(request) = match_rx.recv().await {
            self.metrics.match_requests_in_queue.dec();

            let coordinator = self.clone();
            tokio::spawn(async move {
                let ride_id = request.ride_id;
                let start = Instant::now();
                let label = match coordinator.dispatch(request).await {
                    Ok(outcome) => outcome.label(),
                    Err(err) => {
                        error!(ride_id = %ride_id, error = %err, "dispatch cycle failed");
                        "error"
                    }
                };

                coordinator
                    .metrics
                    .dispatch_latency_seconds
                    .with_label_values(&[label])
                    .observe(start.elapsed().as_secs_f64());
                coordinator
                    .metrics
                    .dispatch_cycles_total
                    .with_label_values(&[label])
                    .inc();
            });
        }

        warn!("dispatch coordinator stopped: match queue closed");
    }

    /// Runs one dispatch cycle to completion. Every cycle that is not
    /// skipped publishes exactly one outcome, failed ones included.
    pub async fn dispatch(&self, request: MatchRequest) -> Result<CycleOutcome, DispatchError> {
        let ride_id = request.ride_id;
        let correlation_id = request.correlation_id;

        match self.run_cycle(request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(ride_id = %ride_id, error = %err, "dispatch cycle aborted");
                self.publish_outcome(&DriverMatchOutcome::unmatched(
                    ride_id,
                    UnmatchedReason::DispatchFailed,
                    correlation_id,
                ))
                .await;
                Err(err)
            }
        }
    }

    async fn run_cycle(&self, request: MatchRequest) -> Result<CycleOutcome, DispatchError> {
        let ride_id = request.ride_id;
        let correlation_id = request.correlation_id;
        request.validate().map_err(DispatchError::InvalidRequest)?;

        let ride = match self.ports.rides.get_ride(ride_id, None).await {
            Ok(ride) => ride,
            Err(RepositoryError::RideNotFound(_)) => return Err(DispatchError::RideNotFound(ride_id)),
            Err(err) => return Err(err.into()),
        };
        if ride.status != RideStatus::Requested {
            info!(ride_id = %ride_id, status = %ride.status, "ride is no longer requested; skipping");
            return Ok(CycleOutcome::Skipped);
        }

        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.offer_timeout);
        let expires_at = offer_deadline(Utc::now(), timeout)?;
        let candidates = self
            .ports
            .locator
            .find_nearby(NearbyQuery {
                latitude: request.pickup.latitude,
                longitude: request.pickup.longitude,
                category: request.category,
                radius_km: request.max_radius_km.unwrap_or(self.config.search_radius_km),
                limit: self.config.max_candidates,
            })
            .await?;

        let earnings = driver_earnings(ride.estimated_fare, self.config.driver_earnings_share);
        let offers: Vec<RideOffer> = candidates
            .iter()
            .filter(|candidate| self.hub.is_connected(candidate.driver_id))
            .map(|candidate| RideOffer {
                offer_id: RideOffer::offer_id_for(ride_id, candidate.driver_id),
                ride_id,
                driver_id: candidate.driver_id,
                expires_at,
                estimated_fare: ride.estimated_fare,
                driver_earnings: earnings,
                distance_to_pickup_km: candidate.distance_km,
            })
            .collect();

        if offers.is_empty() {
            info!(ride_id = %ride_id, candidates = candidates.len(), "no reachable drivers");
            return Ok(self
                .finish_unmatched(ride_id, UnmatchedReason::NoDriversAvailable, correlation_id)
                .await);
        }

        let Some(mut resolution_rx) =
            self.pending
                .open(ride_id, correlation_id, offers.clone(), expires_at)
        else {
            debug!(ride_id = %ride_id, "dispatch cycle already running for ride");
            return Ok(CycleOutcome::Skipped);
        };

        // a cancellation between the first read and `open` found nothing to retract
        let status = match self.ports.rides.get_ride(ride_id, None).await {
            Ok(current) => current.status,
            Err(err) => {
                self.discard_cycle(ride_id);
                return Err(err.into());
            }
        };
        if status != RideStatus::Requested {
            self.discard_cycle(ride_id);
            info!(ride_id = %ride_id, status = %status, "ride left REQUESTED before offers went out");
            return Ok(self
                .finish_unmatched(ride_id, UnmatchedReason::RideCancelled, correlation_id)
                .await);
        }

        let mut delivered = 0usize;
        for offer in &offers {
            if !self.pending.contains(ride_id) {
                debug!(ride_id = %ride_id, "cycle closed during fan-out");
                break;
            }
            match self.hub.send_to_driver(offer.driver_id, offer_frame(&ride, offer)) {
                Ok(SendOutcome::Delivered) => {
                    delivered += 1;
                    self.metrics.offers_sent_total.inc();
                }
                Ok(SendOutcome::NotConnected) => self.pending.withdraw(ride_id, offer.driver_id),
                Err(err) => {
                    warn!(ride_id = %ride_id, error = %err, "offer delivery failed");
                    self.pending.withdraw(ride_id, offer.driver_id);
                }
            }
        }
        info!(
            ride_id = %ride_id,
            candidates = candidates.len(),
            delivered,
            "ride offers sent"
        );

        if let Some(closed) = self.pending.close_if_exhausted(ride_id) {
            let reason = if closed.declined.is_empty() {
                UnmatchedReason::NoDriversAvailable
            } else {
                UnmatchedReason::AllDeclined
            };
            return Ok(self.finish_unmatched(ride_id, reason, correlation_id).await);
        }

        let resolution = match tokio::time::timeout(timeout, &mut resolution_rx).await {
            Ok(resolution) => resolution.ok(),
            Err(_) => match self.pending.expire(ride_id) {
                Some(closed) => {
                    self.notify(&closed, RetractionReason::Expired);
                    info!(ride_id = %ride_id, "dispatch cycle timed out");
                    return Ok(self
                        .finish_unmatched(ride_id, UnmatchedReason::Timeout, correlation_id)
                        .await);
                }
                // someone else closed the entry as the timer fired
                None => resolution_rx.await.ok(),
            },
        };

        let reason = match resolution {
            Some(Resolution::Matched { driver_id }) => return Ok(CycleOutcome::Matched { driver_id }),
            Some(Resolution::AllDeclined) => UnmatchedReason::AllDeclined,
            Some(Resolution::Cancelled) => UnmatchedReason::RideCancelled,
            Some(Resolution::Expired) | None => UnmatchedReason::Timeout,
        };
        Ok(self.finish_unmatched(ride_id, reason, correlation_id).await)
    }

    /// Resolves one driver response. Acceptances race through the pending
    /// table's compare-and-clear, so at most one per ride gets past it.
    pub async fn handle_response(
        &self,
        driver_id: Uuid,
        response: RideResponse,
    ) -> Result<ResponseOutcome, DispatchError> {
        let ride_id = response.ride_id;

        if !response.accepted {
            match self.pending.decline(ride_id, response.offer_id, driver_id) {
                DeclineOutcome::Recorded => {
                    debug!(ride_id = %ride_id, driver_id = %driver_id, "offer declined");
                }
                DeclineOutcome::AllDeclined(mut closed) => {
                    info!(ride_id = %ride_id, "every candidate declined");
                    closed.resolve(Resolution::AllDeclined);
                }
                DeclineOutcome::Unknown => {
                    debug!(ride_id = %ride_id, driver_id = %driver_id, "decline for unknown offer");
                }
            }
            return Ok(ResponseOutcome::Declined);
        }

        let claimed = match self
            .pending
            .claim(ride_id, response.offer_id, driver_id, Utc::now())
        {
            Ok(claimed) => claimed,
            Err(err) => {
                let reason = match err {
                    ClaimError::NotPending => self.closed_cycle_reason(ride_id).await,
                    ClaimError::NoSuchOffer => RetractionReason::NotFound,
                    ClaimError::Expired => RetractionReason::Expired,
                };
                self.metrics.late_acceptances_total.inc();
                warn!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    reason = ?reason,
                    "acceptance rejected: ride no longer available"
                );
                self.send_or_log(
                    driver_id,
                    OutboundFrame::unavailable(ride_id, Some(response.offer_id), reason),
                );
                return Ok(ResponseOutcome::Rejected(reason));
            }
        };

        let winner = claimed.winner;
        let mut rest = claimed.rest;

        let mutation: RideMutation = Box::new(move |ride: &mut Ride| {
            RideStateMachine::new(ride)
                .assign_driver(driver_id, Utc::now())
                .map(|_| ())
        });
        match self.ports.rides.update_ride(ride_id, mutation).await {
            Ok(change) => {
                self.notify(&rest, RetractionReason::Claimed);
                self.send_or_log(
                    driver_id,
                    OutboundFrame::RideDetails(RideDetailsFrame::from(&change.current)),
                );
                self.set_driver_status(driver_id, DriverStatus::Busy, Some(ride_id))
                    .await;
                self.publish_outcome(&DriverMatchOutcome::matched(
                    ride_id,
                    driver_id,
                    rest.correlation_id,
                ))
                .await;
                rest.resolve(Resolution::Matched { driver_id });

                info!(ride_id = %ride_id, driver_id = %driver_id, "ride matched");
                Ok(ResponseOutcome::Accepted)
            }
            Err(err) => {
                let reason = match err {
                    RepositoryError::RideNotFound(_) => RetractionReason::NotFound,
                    _ => RetractionReason::Cancelled,
                };
                warn!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    error = %err,
                    "acceptance rejected: ride left REQUESTED"
                );
                self.send_or_log(
                    driver_id,
                    OutboundFrame::unavailable(ride_id, Some(winner.offer_id), reason),
                );
                self.notify(&rest, reason);
                rest.resolve(Resolution::Cancelled);
                Ok(ResponseOutcome::Rejected(reason))
            }
        }
    }

    /// Drops an entry no driver has seen an offer for yet.
    fn discard_cycle(&self, ride_id: Uuid) {
        if let Some(mut closed) = self.pending.retract(ride_id) {
            closed.resolve(Resolution::Cancelled);
        }
    }

    /// Best guess at why a ride has no open cycle. Advisory only: a
    /// concurrent winner may not have committed yet.
    async fn closed_cycle_reason(&self, ride_id: Uuid) -> RetractionReason {
        match self.ports.rides.get_ride(ride_id, None).await {
            Ok(ride) => match ride.status {
                RideStatus::Requested => RetractionReason::Expired,
                RideStatus::Cancelled => RetractionReason::Cancelled,
                _ => RetractionReason::Claimed,
            },
            Err(_) => RetractionReason::NotFound,
        }
    }

    /// Passenger-initiated cancellation. With `passenger_id` set, rides of
    /// other passengers are reported as not found.
    pub async fn cancel_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<Ride, DispatchError> {
        if passenger_id.is_some() {
            self.ports.rides.get_ride(ride_id, passenger_id).await?;
        }

        let mutation: RideMutation = Box::new(move |ride: &mut Ride| {
            RideStateMachine::new(ride)
                .cancel(reason, Utc::now())
                .map(|_| ())
        });
        let change = self.ports.rides.update_ride(ride_id, mutation).await?;
        self.after_status_change(&change).await;

        info!(ride_id = %ride_id, "ride cancelled");
        Ok(change.current)
    }

    /// Applies a transition from the status feed. Out-of-order or illegal
    /// transitions are logged and reported as `Ok(None)`.
    pub async fn apply_status_update(
        &self,
        update: RideStatusUpdate,
    ) -> Result<Option<Ride>, DispatchError> {
        let RideStatusUpdate {
            ride_id,
            status,
            driver_id,
            final_fare,
            reason,
        } = update;

        let mutation: RideMutation = Box::new(move |ride: &mut Ride| {
            RideStateMachine::new(ride)
                .apply_status(status, driver_id, final_fare, reason, Utc::now())
                .map(|_| ())
        });
        let change = match self.ports.rides.update_ride(ride_id, mutation).await {
            Ok(change) => change,
            Err(RepositoryError::Transition(err)) => {
                warn!(ride_id = %ride_id, error = %err, "ignoring status update");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        self.after_status_change(&change).await;
        Ok(Some(change.current))
    }

    async fn after_status_change(&self, change: &RideChange) {
        let (previous, current) = (&change.previous, &change.current);
        if previous.status == current.status {
            return;
        }

        if previous.status == RideStatus::Requested {
            let reason = match current.status {
                RideStatus::Cancelled => RetractionReason::Cancelled,
                _ => RetractionReason::Claimed,
            };
            self.retract_ride(current.id, reason);
        }

        match current.status {
            RideStatus::Cancelled => {
                if let Some(released) = previous.driver_id {
                    self.set_driver_status(released, DriverStatus::Available, None)
                        .await;
                }
            }
            RideStatus::Completed => {
                if let Some(driver_id) = current.driver_id {
                    self.set_driver_status(driver_id, DriverStatus::Available, None)
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Closes the ride's open cycle, if any, and pushes a retraction to
    /// every driver still holding an offer.
    pub fn retract_ride(&self, ride_id: Uuid, reason: RetractionReason) -> bool {
        match self.pending.retract(ride_id) {
            Some(mut closed) => {
                self.notify(&closed, reason);
                closed.resolve(Resolution::Cancelled);
                info!(ride_id = %ride_id, retracted = closed.offers.len(), "pending offers retracted");
                true
            }
            None => false,
        }
    }

    /// Persists a driver status change and publishes it. Failures are
    /// logged; the caller's primary effect stands.
    pub async fn set_driver_status(&self, driver_id: Uuid, status: DriverStatus, ride_id: Option<Uuid>) {
        if let Err(err) = self
            .ports
            .drivers
            .update_driver_status(driver_id, status)
            .await
        {
            warn!(driver_id = %driver_id, error = %err, "failed to persist driver status");
        }

        let event = DriverStatusEvent {
            driver_id,
            status,
            ride_id,
            changed_at: Utc::now(),
        };
        if let Err(err) = publish_json(
            self.ports.broker.as_ref(),
            DISPATCH_EXCHANGE,
            &driver_status_key(driver_id),
            &event,
        )
        .await
        {
            warn!(driver_id = %driver_id, error = %err, "failed to publish driver status");
        }
    }

    /// Backstop sweep of entries whose cycle never closed them.
    pub fn sweep_expired(&self) -> usize {
        let swept = self.pending.remove_expired(Utc::now());
        let count = swept.len();
        for mut closed in swept {
            self.notify(&closed, RetractionReason::Expired);
            closed.resolve(Resolution::Expired);
        }
        count
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = self.sweep_expired();
                if swept > 0 {
                    debug!(swept, "pending offers sweep");
                }
            }
        })
    }

    async fn finish_unmatched(
        &self,
        ride_id: Uuid,
        reason: UnmatchedReason,
        correlation_id: Uuid,
    ) -> CycleOutcome {
        self.publish_outcome(&DriverMatchOutcome::unmatched(ride_id, reason, correlation_id))
            .await;
        CycleOutcome::Unmatched(reason)
    }

    async fn publish_outcome(&self, outcome: &DriverMatchOutcome) {
        if let Err(err) = publish_json(
            self.ports.broker.as_ref(),
            DISPATCH_EXCHANGE,
            &driver_response_key(outcome.ride_id),
            outcome,
        )
        .await
        {
            warn!(ride_id = %outcome.ride_id, error = %err, "failed to publish match outcome");
        }
    }

    fn notify(&self, closed: &ClosedRide, reason: RetractionReason) {
        for offer in &closed.offers {
            self.send_or_log(
                offer.driver_id,
                OutboundFrame::unavailable(offer.ride_id, Some(offer.offer_id), reason),
            );
        }
    }

    fn send_or_log(&self, driver_id: Uuid, frame: OutboundFrame) {
        match self.hub.send_to_driver(driver_id, frame) {
            Ok(SendOutcome::Delivered) => {}
            Ok(SendOutcome::NotConnected) => {
                debug!(driver_id = %driver_id, "driver not connected; notice dropped");
            }
            Err(err) => warn!(error = %err, "notice delivery failed"),
        }
    }
}

fn offer_deadline(now: DateTime<Utc>, timeout: Duration) -> Result<DateTime<Utc>, DispatchError> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .ok_or_else(|| DispatchError::InvalidRequest(format!("offer timeout {timeout:?} out of range")))
}

fn offer_frame(ride: &Ride, offer: &RideOffer) -> OutboundFrame {
    OutboundFrame::RideOffer(RideOfferFrame {
        offer_id: offer.offer_id,
        ride_id: ride.id,
        ride_number: ride.ride_number.clone(),
        pickup_location: ride.pickup.clone(),
        destination_location: ride.destination.clone(),
        estimated_fare: offer.estimated_fare,
        driver_earnings: offer.driver_earnings,
        distance_to_pickup_km: offer.distance_to_pickup_km,
        expires_at: offer.expires_at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Duration;
    use uuid::Uuid;

    use super::{CycleOutcome, DispatchCoordinator, DispatchPorts, offer_deadline};
    use crate::config::{DispatchConfig, HubConfig};
    use crate::error::RepositoryError;
    use crate::hub::DriverConnectionHub;
    use crate::models::driver::{Driver, DriverStatus};
    use crate::models::outcome::{MatchRequest, UnmatchedReason};
    use crate::models::ride::{Location, Ride, RideCategory, RideStatus};
    use crate::observability::metrics::Metrics;
    use crate::ports::broker::{InMemoryBroker, driver_response_key};
    use crate::ports::locator::InMemoryDriverStore;
    use crate::ports::repository::{
        InMemoryRideRepository, RideChange, RideMutation, RideRepository,
    };

    /// Serves the first read as still REQUESTED, then the stored ride.
    struct StaleFirstRead {
        inner: InMemoryRideRepository,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl RideRepository for StaleFirstRead {
        async fn create_ride(&self, ride: Ride) -> Result<Ride, RepositoryError> {
            self.inner.create_ride(ride).await
        }

        async fn get_ride(
            &self,
            ride_id: Uuid,
            passenger_id: Option<Uuid>,
        ) -> Result<Ride, RepositoryError> {
            let mut ride = self.inner.get_ride(ride_id, passenger_id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                ride.status = RideStatus::Requested;
            }
            Ok(ride)
        }

        async fn update_ride(
            &self,
            ride_id: Uuid,
            mutation: RideMutation,
        ) -> Result<RideChange, RepositoryError> {
            self.inner.update_ride(ride_id, mutation).await
        }

        async fn ride_count(&self) -> Result<usize, RepositoryError> {
            self.inner.ride_count().await
        }
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(CycleOutcome::Matched { driver_id: Uuid::nil() }.label(), "matched");
        assert_eq!(CycleOutcome::Unmatched(UnmatchedReason::Timeout).label(), "timeout");
        assert_eq!(CycleOutcome::Unmatched(UnmatchedReason::DispatchFailed).label(), "error");
        assert_eq!(CycleOutcome::Skipped.label(), "skipped");
    }

    #[test]
    fn offer_deadline_rejects_unrepresentable_windows() {
        let now = Utc::now();
        let deadline = offer_deadline(now, Duration::from_secs(120)).unwrap();
        assert_eq!((deadline - now).num_seconds(), 120);

        assert!(offer_deadline(now, Duration::from_secs(10_000_000_000_000)).is_err());
        assert!(offer_deadline(now, Duration::from_secs(u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn cancellation_before_fan_out_sends_no_offers() {
        let metrics = Metrics::new();
        let hub = Arc::new(DriverConnectionHub::new(HubConfig::default(), metrics.clone()));
        let drivers = Arc::new(InMemoryDriverStore::new());
        let driver_id = Uuid::from_u128(1);
        drivers.upsert(Driver {
            id: driver_id,
            name: "driver-1".to_string(),
            category: RideCategory::Economy,
            location: Location::new(52.521, 13.405),
            status: DriverStatus::Available,
            rating: 4.8,
            updated_at: Utc::now(),
        });
        let mut lease = hub.register(driver_id);

        let mut ride = Ride::new(
            Uuid::new_v4(),
            RideCategory::Economy,
            Location::new(52.52, 13.405),
            Location::new(52.50, 13.44),
            20.0,
        );
        ride.status = RideStatus::Cancelled;
        let inner = InMemoryRideRepository::new();
        inner.create_ride(ride.clone()).await.unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        let mut published = broker.published();
        let ports = DispatchPorts {
            locator: drivers.clone(),
            rides: Arc::new(StaleFirstRead {
                inner,
                reads: AtomicUsize::new(0),
            }),
            drivers,
            broker,
        };
        let (coordinator, _match_rx) =
            DispatchCoordinator::new(hub, ports, DispatchConfig::default(), metrics, 8);

        let outcome = coordinator
            .dispatch(MatchRequest {
                ride_id: ride.id,
                pickup: ride.pickup.clone(),
                category: ride.category,
                max_radius_km: None,
                timeout_secs: Some(60),
                correlation_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Unmatched(UnmatchedReason::RideCancelled));
        assert!(lease.outbound_rx.try_recv().is_err());
        assert!(coordinator.pending().is_empty());

        let message = published.try_recv().unwrap();
        assert_eq!(message.routing_key, driver_response_key(ride.id));
        let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["accepted"], false);
        assert_eq!(body["reason"], "ride_cancelled");
    }
}
