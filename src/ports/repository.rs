use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{RepositoryError, TransitionError};
use crate::models::driver::{Driver, DriverStatus, LocationSample};
use crate::models::ride::Ride;

/// A guarded change applied to one ride under the repository's row lock.
pub type RideMutation = Box<dyn FnOnce(&mut Ride) -> Result<(), TransitionError> + Send>;

#[derive(Debug, Clone)]
pub struct RideChange {
    pub previous: Ride,
    pub current: Ride,
}

#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn create_ride(&self, ride: Ride) -> Result<Ride, RepositoryError>;

    /// With `passenger_id` set, rides owned by someone else are reported
    /// as not found.
    async fn get_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Option<Uuid>,
    ) -> Result<Ride, RepositoryError>;

    /// Applies `mutation` atomically with respect to other updates of the
    /// same ride. A failed mutation leaves the stored ride untouched.
    async fn update_ride(
        &self,
        ride_id: Uuid,
        mutation: RideMutation,
    ) -> Result<RideChange, RepositoryError>;

    async fn ride_count(&self) -> Result<usize, RepositoryError>;
}

#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn get_driver(&self, driver_id: Uuid) -> Result<Driver, RepositoryError>;

    async fn update_driver_status(
        &self,
        driver_id: Uuid,
        status: DriverStatus,
    ) -> Result<Driver, RepositoryError>;

    async fn create_session(&self, driver_id: Uuid) -> Result<Uuid, RepositoryError>;

    async fn end_session(&self, session_id: Uuid) -> Result<(), RepositoryError>;

    async fn record_location(&self, sample: LocationSample) -> Result<(), RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryRideRepository {
    rides: DashMap<Uuid, Ride>,
}

impl InMemoryRideRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RideRepository for InMemoryRideRepository {
    async fn create_ride(&self, ride: Ride) -> Result<Ride, RepositoryError> {
        self.rides.insert(ride.id, ride.clone());
        Ok(ride)
    }

    async fn get_ride(
        &self,
        ride_id: Uuid,
        passenger_id: Option<Uuid>,
    ) -> Result<Ride, RepositoryError> {
        let ride = self
            .rides
            .get(&ride_id)
            .map(|entry| entry.value().clone())
            .ok_or(RepositoryError::RideNotFound(ride_id))?;

        match passenger_id {
            Some(passenger_id) if ride.passenger_id != passenger_id => {
                Err(RepositoryError::RideNotFound(ride_id))
            }
            _ => Ok(ride),
        }
    }

    async fn update_ride(
        &self,
        ride_id: Uuid,
        mutation: RideMutation,
    ) -> Result<RideChange, RepositoryError> {
        let mut entry = self
            .rides
            .get_mut(&ride_id)
            .ok_or(RepositoryError::RideNotFound(ride_id))?;

        let previous = entry.value().clone();
        let mut current = previous.clone();
        mutation(&mut current)?;
        *entry.value_mut() = current.clone();

        Ok(RideChange { previous, current })
    }

    async fn ride_count(&self) -> Result<usize, RepositoryError> {
        Ok(self.rides.len())
    }
}
