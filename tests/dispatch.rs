use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use ride_dispatch::config::Config;
use ride_dispatch::engine::consumers::MatchRequestConsumer;
use ride_dispatch::engine::dispatch::{CycleOutcome, ResponseOutcome};
use ride_dispatch::error::{DispatchError, HandlerError};
use ride_dispatch::hub::messages::{OutboundFrame, RetractionReason, RideOfferFrame, RideResponse};
use ride_dispatch::hub::session::SessionLease;
use ride_dispatch::models::driver::{Driver, DriverStatus};
use ride_dispatch::models::outcome::{MatchRequest, RideStatusUpdate, UnmatchedReason};
use ride_dispatch::models::ride::{Location, Ride, RideCategory, RideStatus};
use ride_dispatch::ports::auth::StaticTokenVerifier;
use ride_dispatch::ports::broker::{
    DeliveryHandler, InMemoryBroker, PublishedMessage, driver_response_key,
};
use ride_dispatch::ports::repository::{DriverRepository, RideRepository};
use ride_dispatch::state::AppState;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use uuid::Uuid;

fn pickup() -> Location {
    Location::new(52.52, 13.405)
}

struct Fixture {
    state: Arc<AppState>,
    published: broadcast::Receiver<PublishedMessage>,
    _match_rx: mpsc::Receiver<MatchRequest>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let published = broker.published();
        let (state, match_rx) = AppState::new(
            config,
            Arc::new(StaticTokenVerifier::new()),
            broker,
        );
        Self {
            state: Arc::new(state),
            published,
            _match_rx: match_rx,
        }
    }

    /// Registers an AVAILABLE economy driver `0.001 * seed` degrees north
    /// of the pickup.
    fn add_driver(&self, seed: u128) -> Uuid {
        let id = Uuid::from_u128(seed);
        self.state.drivers.upsert(Driver {
            id,
            name: format!("driver-{seed}"),
            category: RideCategory::Economy,
            location: Location::new(52.52 + 0.001 * seed as f64, 13.405),
            status: DriverStatus::Available,
            rating: 4.8,
            updated_at: Utc::now(),
        });
        id
    }

    fn connect(&self, driver_id: Uuid) -> SessionLease {
        self.state.hub.register(driver_id)
    }

    async fn ride(&self) -> Ride {
        let ride = Ride::new(
            Uuid::new_v4(),
            RideCategory::Economy,
            pickup(),
            Location::new(52.50, 13.44),
            20.0,
        );
        self.state.rides.create_ride(ride).await.unwrap()
    }

    async fn ride_status(&self, ride_id: Uuid) -> Ride {
        self.state.rides.get_ride(ride_id, None).await.unwrap()
    }

    fn spawn_cycle(&self, ride: &Ride, timeout_secs: u64) -> tokio::task::JoinHandle<CycleOutcome> {
        let coordinator = self.state.coordinator.clone();
        let request = match_request(ride, Some(timeout_secs));
        tokio::spawn(async move { coordinator.dispatch(request).await.unwrap() })
    }

    async fn respond(&self, driver_id: Uuid, offer: &RideOfferFrame, accepted: bool) -> ResponseOutcome {
        self.state
            .coordinator
            .handle_response(
                driver_id,
                RideResponse {
                    offer_id: offer.offer_id,
                    ride_id: offer.ride_id,
                    accepted,
                },
            )
            .await
            .unwrap()
    }

    /// Next message published on `driver.response.{ride_id}`.
    async fn outcome_for(&mut self, ride_id: Uuid) -> Value {
        let key = driver_response_key(ride_id);
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.published.recv())
                .await
                .expect("outcome published in time")
                .unwrap();
            if message.routing_key == key {
                return serde_json::from_slice(&message.payload).unwrap();
            }
        }
    }
}

fn match_request(ride: &Ride, timeout_secs: Option<u64>) -> MatchRequest {
    MatchRequest {
        ride_id: ride.id,
        pickup: ride.pickup.clone(),
        category: ride.category,
        max_radius_km: None,
        timeout_secs,
        correlation_id: Uuid::new_v4(),
    }
}

async fn next_frame(lease: &mut SessionLease) -> OutboundFrame {
    tokio::time::timeout(Duration::from_secs(5), lease.outbound_rx.recv())
        .await
        .expect("frame arrived in time")
        .expect("session still open")
}

async fn next_offer(lease: &mut SessionLease) -> RideOfferFrame {
    match next_frame(lease).await {
        OutboundFrame::RideOffer(offer) => offer,
        other => panic!("expected ride_offer, got {other:?}"),
    }
}

fn retraction_reason(frame: OutboundFrame) -> RetractionReason {
    match frame {
        OutboundFrame::RideUnavailable { reason, .. } => reason,
        other => panic!("expected ride_unavailable, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acceptances_match_exactly_one_driver() {
    let fx = Fixture::new();
    let drivers: Vec<Uuid> = (1..=8).map(|seed| fx.add_driver(seed)).collect();
    let mut leases: Vec<SessionLease> = drivers.iter().map(|d| fx.connect(*d)).collect();
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 30);

    let mut offers = Vec::new();
    for lease in leases.iter_mut() {
        offers.push(next_offer(lease).await);
    }

    let responses = drivers.iter().zip(offers.iter()).map(|(driver_id, offer)| {
        let coordinator = fx.state.coordinator.clone();
        let driver_id = *driver_id;
        let response = RideResponse {
            offer_id: offer.offer_id,
            ride_id: offer.ride_id,
            accepted: true,
        };
        tokio::spawn(async move { coordinator.handle_response(driver_id, response).await.unwrap() })
    });
    let outcomes: Vec<ResponseOutcome> = join_all(responses)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<Uuid> = drivers
        .iter()
        .zip(outcomes.iter())
        .filter(|(_, outcome)| **outcome == ResponseOutcome::Accepted)
        .map(|(driver_id, _)| *driver_id)
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, ResponseOutcome::Rejected(_)))
            .count(),
        drivers.len() - 1
    );

    assert_eq!(cycle.await.unwrap(), CycleOutcome::Matched { driver_id: winner });

    let stored = fx.ride_status(ride.id).await;
    assert_eq!(stored.status, RideStatus::Matched);
    assert_eq!(stored.driver_id, Some(winner));

    for (driver_id, lease) in drivers.iter().zip(leases.iter_mut()) {
        let frame = next_frame(lease).await;
        if *driver_id == winner {
            assert!(matches!(frame, OutboundFrame::RideDetails(_)));
        } else {
            retraction_reason(frame);
        }
    }
}

#[tokio::test]
async fn unreachable_candidates_are_skipped_silently() {
    let fx = Fixture::new();
    let drivers: Vec<Uuid> = (1..=5).map(|seed| fx.add_driver(seed)).collect();
    let mut connected = vec![fx.connect(drivers[1]), fx.connect(drivers[3])];
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 30);

    let first = next_offer(&mut connected[0]).await;
    let second = next_offer(&mut connected[1]).await;
    assert_eq!(fx.state.metrics.offers_sent_total.get(), 2);
    assert!(fx.state.coordinator.pending().contains(ride.id));

    // both decline, so the cycle ends without waiting for its timer
    assert_eq!(fx.respond(drivers[1], &first, false).await, ResponseOutcome::Declined);
    assert_eq!(fx.respond(drivers[3], &second, false).await, ResponseOutcome::Declined);

    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Unmatched(UnmatchedReason::AllDeclined)
    );
    assert!(!fx.state.coordinator.pending().contains(ride.id));
    assert_eq!(fx.ride_status(ride.id).await.status, RideStatus::Requested);
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_expires_and_late_acceptance_is_rejected() {
    let mut fx = Fixture::new();
    let driver = fx.add_driver(1);
    let mut lease = fx.connect(driver);
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 1);
    let offer = next_offer(&mut lease).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!fx.state.coordinator.pending().contains(ride.id));
    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Unmatched(UnmatchedReason::Timeout)
    );
    assert_eq!(retraction_reason(next_frame(&mut lease).await), RetractionReason::Expired);

    let outcome = fx.outcome_for(ride.id).await;
    assert_eq!(outcome["accepted"], false);
    assert_eq!(outcome["reason"], "timeout");

    assert_eq!(
        fx.respond(driver, &offer, true).await,
        ResponseOutcome::Rejected(RetractionReason::Expired)
    );
    assert_eq!(fx.state.metrics.late_acceptances_total.get(), 1);
    assert_eq!(fx.ride_status(ride.id).await.status, RideStatus::Requested);
}

#[tokio::test]
async fn first_acceptance_wins_and_other_candidate_is_retracted() {
    let mut fx = Fixture::new();
    let d1 = fx.add_driver(1);
    let d2 = fx.add_driver(2);
    let d3 = fx.add_driver(3);
    let mut lease_d2 = fx.connect(d2);
    let mut lease_d3 = fx.connect(d3);
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 120);

    let offer_d2 = next_offer(&mut lease_d2).await;
    let offer_d3 = next_offer(&mut lease_d3).await;
    assert_ne!(offer_d2.offer_id, offer_d3.offer_id);
    assert_eq!(offer_d3.ride_number, ride.ride_number);
    assert_eq!(offer_d3.driver_earnings, 16.0);
    assert!(!fx.state.hub.is_connected(d1));

    assert_eq!(fx.respond(d3, &offer_d3, true).await, ResponseOutcome::Accepted);
    assert_eq!(cycle.await.unwrap(), CycleOutcome::Matched { driver_id: d3 });

    let stored = fx.ride_status(ride.id).await;
    assert_eq!(stored.status, RideStatus::Matched);
    assert_eq!(stored.driver_id, Some(d3));

    match next_frame(&mut lease_d3).await {
        OutboundFrame::RideDetails(details) => assert_eq!(details.ride_id, ride.id),
        other => panic!("expected ride_details, got {other:?}"),
    }
    assert_eq!(retraction_reason(next_frame(&mut lease_d2).await), RetractionReason::Claimed);

    assert!(matches!(
        fx.respond(d2, &offer_d2, true).await,
        ResponseOutcome::Rejected(_)
    ));
    assert_eq!(fx.ride_status(ride.id).await.driver_id, Some(d3));

    let winner = fx.state.drivers.get_driver(d3).await.unwrap();
    assert_eq!(winner.status, DriverStatus::Busy);

    let outcome = fx.outcome_for(ride.id).await;
    assert_eq!(outcome["accepted"], true);
    assert_eq!(outcome["driver_id"], d3.to_string());
}

#[tokio::test]
async fn no_reachable_driver_ends_cycle_immediately() {
    let mut fx = Fixture::new();
    fx.add_driver(1);
    fx.add_driver(2);
    let ride = fx.ride().await;

    let outcome = fx.spawn_cycle(&ride, 120).await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Unmatched(UnmatchedReason::NoDriversAvailable)
    );
    assert!(!fx.state.coordinator.pending().contains(ride.id));

    let published = fx.outcome_for(ride.id).await;
    assert_eq!(published["accepted"], false);
    assert_eq!(published["reason"], "no_drivers_available");
}

#[tokio::test]
async fn cancellation_retracts_offers_in_flight() {
    let fx = Fixture::new();
    let driver = fx.add_driver(1);
    let mut lease = fx.connect(driver);
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 120);
    let offer = next_offer(&mut lease).await;

    let cancelled = fx
        .state
        .coordinator
        .cancel_ride(ride.id, Some(ride.passenger_id), Some("changed plans".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);

    assert_eq!(retraction_reason(next_frame(&mut lease).await), RetractionReason::Cancelled);
    assert_eq!(
        cycle.await.unwrap(),
        CycleOutcome::Unmatched(UnmatchedReason::RideCancelled)
    );

    assert_eq!(
        fx.respond(driver, &offer, true).await,
        ResponseOutcome::Rejected(RetractionReason::Cancelled)
    );
    assert_eq!(fx.ride_status(ride.id).await.status, RideStatus::Cancelled);
}

#[tokio::test]
async fn ride_that_is_no_longer_requested_is_skipped() {
    let fx = Fixture::new();
    let driver = fx.add_driver(1);
    let _lease = fx.connect(driver);
    let ride = fx.ride().await;
    fx.state
        .coordinator
        .cancel_ride(ride.id, None, None)
        .await
        .unwrap();

    assert_eq!(fx.spawn_cycle(&ride, 120).await.unwrap(), CycleOutcome::Skipped);
    assert_eq!(fx.state.metrics.offers_sent_total.get(), 0);
}

#[tokio::test]
async fn status_feed_ignores_backward_transitions_and_releases_driver_on_completion() {
    let fx = Fixture::new();
    let driver = fx.add_driver(1);
    let mut lease = fx.connect(driver);
    let ride = fx.ride().await;

    let cycle = fx.spawn_cycle(&ride, 120);
    let offer = next_offer(&mut lease).await;
    fx.respond(driver, &offer, true).await;
    cycle.await.unwrap();

    let update = |status: RideStatus, final_fare: Option<f64>| RideStatusUpdate {
        ride_id: ride.id,
        status,
        driver_id: Some(driver),
        final_fare,
        reason: None,
    };
    let coordinator = &fx.state.coordinator;

    for status in [RideStatus::EnRoute, RideStatus::Arrived, RideStatus::InProgress] {
        let applied = coordinator.apply_status_update(update(status, None)).await.unwrap();
        assert_eq!(applied.unwrap().status, status);
    }

    // redelivery is idempotent, going backwards is ignored
    assert!(coordinator
        .apply_status_update(update(RideStatus::InProgress, None))
        .await
        .unwrap()
        .is_some());
    assert!(coordinator
        .apply_status_update(update(RideStatus::EnRoute, None))
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.ride_status(ride.id).await.status, RideStatus::InProgress);

    // a started ride cannot be cancelled
    assert!(coordinator.cancel_ride(ride.id, None, None).await.is_err());

    let completed = coordinator
        .apply_status_update(update(RideStatus::Completed, Some(23.5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.final_fare, Some(23.5));

    let released = fx.state.drivers.get_driver(driver).await.unwrap();
    assert_eq!(released.status, DriverStatus::Available);
}

#[tokio::test]
async fn oversized_offer_timeout_fails_the_cycle_and_reports_it() {
    let mut fx = Fixture::new();
    let driver = fx.add_driver(1);
    let mut lease = fx.connect(driver);
    let ride = fx.ride().await;

    let err = fx
        .state
        .coordinator
        .dispatch(match_request(&ride, Some(10_000_000_000_000)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRequest(_)));

    let published = fx.outcome_for(ride.id).await;
    assert_eq!(published["accepted"], false);
    assert_eq!(published["reason"], "dispatch_failed");

    assert!(lease.outbound_rx.try_recv().is_err());
    assert!(fx.state.coordinator.pending().is_empty());
    assert_eq!(fx.ride_status(ride.id).await.status, RideStatus::Requested);
}

#[tokio::test]
async fn unrepresentable_default_timeout_fails_the_cycle_without_panicking() {
    let mut config = Config::default();
    config.dispatch.offer_timeout = Duration::from_secs(u64::MAX);
    let mut fx = Fixture::with_config(config);
    let driver = fx.add_driver(1);
    let _lease = fx.connect(driver);
    let ride = fx.ride().await;

    let result = fx.state.coordinator.dispatch(match_request(&ride, None)).await;
    assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
    assert_eq!(fx.outcome_for(ride.id).await["reason"], "dispatch_failed");
}

#[tokio::test]
async fn failed_lookups_still_publish_an_outcome() {
    let mut fx = Fixture::new();
    fx.add_driver(1);
    let ride = fx.ride().await;

    let mut bad_radius = match_request(&ride, Some(30));
    bad_radius.max_radius_km = Some(-1.0);
    assert!(fx.state.coordinator.dispatch(bad_radius).await.is_err());
    let published = fx.outcome_for(ride.id).await;
    assert_eq!(published["accepted"], false);
    assert_eq!(published["reason"], "dispatch_failed");

    let missing = Ride::new(
        Uuid::new_v4(),
        RideCategory::Economy,
        pickup(),
        Location::new(52.50, 13.44),
        20.0,
    );
    let err = fx
        .state
        .coordinator
        .dispatch(match_request(&missing, Some(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RideNotFound(_)));
    assert_eq!(fx.outcome_for(missing.id).await["reason"], "dispatch_failed");
}

#[tokio::test]
async fn match_consumer_rejects_requests_no_cycle_could_run() {
    let fx = Fixture::new();
    let ride = fx.ride().await;
    let consumer = MatchRequestConsumer::new(fx.state.coordinator.clone());

    let mut oversized = match_request(&ride, Some(10_000_000_000_000));
    let payload = serde_json::to_vec(&oversized).unwrap();
    assert!(matches!(
        consumer.handle(&payload).await,
        Err(HandlerError::Malformed(_))
    ));

    oversized.timeout_secs = Some(30);
    oversized.max_radius_km = Some(-1.0);
    let payload = serde_json::to_vec(&oversized).unwrap();
    assert!(matches!(
        consumer.handle(&payload).await,
        Err(HandlerError::Malformed(_))
    ));

    assert_eq!(fx.state.metrics.match_requests_in_queue.get(), 0);

    let payload = serde_json::to_vec(&match_request(&ride, Some(30))).unwrap();
    assert!(consumer.handle(&payload).await.is_ok());
    assert_eq!(fx.state.metrics.match_requests_in_queue.get(), 1);
}
