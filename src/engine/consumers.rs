//! Broker handlers for the dispatch boundary's inbound queues.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::queue::enqueue_match_request;
use crate::error::{BrokerError, DispatchError, HandlerError, RepositoryError};
use crate::models::outcome::{MatchRequest, RideStatusUpdate};
use crate::ports::broker::{DRIVER_MATCHING_QUEUE, DeliveryHandler, MessageBroker, RIDE_STATUS_QUEUE};

/// `driver_matching`: hands match requests to the coordinator's queue.
pub struct MatchRequestConsumer {
    coordinator: Arc<DispatchCoordinator>,
}

impl MatchRequestConsumer {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl DeliveryHandler for MatchRequestConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let request: MatchRequest = serde_json::from_slice(payload)
            .map_err(|err| HandlerError::Malformed(err.to_string()))?;
        request.validate().map_err(HandlerError::Malformed)?;

        debug!(ride_id = %request.ride_id, category = request.category.as_str(), "match request received");
        enqueue_match_request(&self.coordinator, request)
            .await
            .map_err(|err| HandlerError::Transient(err.to_string()))
    }
}

/// `ride_status`: applies externally driven transitions.
pub struct RideStatusConsumer {
    coordinator: Arc<DispatchCoordinator>,
}

impl RideStatusConsumer {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl DeliveryHandler for RideStatusConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let update: RideStatusUpdate = serde_json::from_slice(payload)
            .map_err(|err| HandlerError::Malformed(err.to_string()))?;
        let ride_id = update.ride_id;
        let status = update.status;

        match self.coordinator.apply_status_update(update).await {
            Ok(Some(ride)) => {
                info!(ride_id = %ride_id, status = %ride.status, "ride status applied");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(DispatchError::Repository(RepositoryError::RideNotFound(_))) => {
                warn!(ride_id = %ride_id, status = %status, "status update for unknown ride; dropping");
                Ok(())
            }
            Err(err) => Err(HandlerError::Transient(err.to_string())),
        }
    }
}

/// Starts consuming both inbound queues.
pub async fn subscribe_all(
    broker: &dyn MessageBroker,
    coordinator: Arc<DispatchCoordinator>,
) -> Result<(), BrokerError> {
    broker
        .subscribe(
            DRIVER_MATCHING_QUEUE,
            Arc::new(MatchRequestConsumer::new(coordinator.clone())),
        )
        .await?;
    broker
        .subscribe(RIDE_STATUS_QUEUE, Arc::new(RideStatusConsumer::new(coordinator)))
        .await?;
    info!(
        queues = ?[DRIVER_MATCHING_QUEUE, RIDE_STATUS_QUEUE],
        "dispatch consumers subscribed"
    );
    Ok(())
}
