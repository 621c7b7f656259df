use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::dispatch::{DispatchCoordinator, DispatchPorts};
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::router::DriverEventRouter;
use crate::hub::DriverConnectionHub;
use crate::models::outcome::MatchRequest;
use crate::observability::metrics::Metrics;
use crate::ports::auth::TokenVerifier;
use crate::ports::broker::MessageBroker;
use crate::ports::locator::InMemoryDriverStore;
use crate::ports::repository::{InMemoryRideRepository, RideRepository};

pub struct AppState {
    pub config: Config,
    pub hub: Arc<DriverConnectionHub>,
    pub coordinator: Arc<DispatchCoordinator>,
    pub router: Arc<DriverEventRouter>,
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rides: Arc<dyn RideRepository>,
    pub drivers: Arc<InMemoryDriverStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the core together. The returned receiver feeds
    /// [`DispatchCoordinator::run`].
    pub fn new(
        config: Config,
        verifier: Arc<dyn TokenVerifier>,
        broker: Arc<dyn MessageBroker>,
    ) -> (Self, mpsc::Receiver<MatchRequest>) {
        let metrics = Metrics::new();
        let hub = Arc::new(DriverConnectionHub::new(config.hub.clone(), metrics.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let rides: Arc<dyn RideRepository> = Arc::new(InMemoryRideRepository::new());
        let drivers = Arc::new(InMemoryDriverStore::new());

        let ports = DispatchPorts {
            locator: drivers.clone(),
            rides: rides.clone(),
            drivers: drivers.clone(),
            broker: broker.clone(),
        };
        let (coordinator, match_rx) = DispatchCoordinator::new(
            hub.clone(),
            ports,
            config.dispatch.clone(),
            metrics.clone(),
            config.match_queue_size,
        );
        let coordinator = Arc::new(coordinator);

        let router = Arc::new(DriverEventRouter::new(
            hub.clone(),
            coordinator.clone(),
            limiter.clone(),
            drivers.clone(),
            drivers.clone(),
            metrics.clone(),
        ));

        (
            Self {
                config,
                hub,
                coordinator,
                router,
                limiter,
                verifier,
                rides,
                drivers,
                broker,
                metrics,
            },
            match_rx,
        )
    }
}
