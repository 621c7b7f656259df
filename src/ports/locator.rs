use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::ranking::rank_candidates;
use crate::error::{LocatorError, RepositoryError};
use crate::geo::haversine_km;
use crate::models::driver::{Driver, DriverStatus, LocationSample, NearbyDriver};
use crate::models::ride::{Location, RideCategory};
use crate::ports::repository::DriverRepository;

const LOCATION_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub category: RideCategory,
    pub radius_km: f64,
    pub limit: usize,
}

#[async_trait]
pub trait DriverLocator: Send + Sync {
    /// AVAILABLE drivers of the category within the radius, nearest first,
    /// higher rating first among equally distant drivers.
    async fn find_nearby(&self, query: NearbyQuery) -> Result<Vec<NearbyDriver>, LocatorError>;

    async fn update_location(&self, driver_id: Uuid, location: Location) -> Result<(), LocatorError>;
}

/// In-memory driver registry serving both the locator and driver
/// repository contracts.
#[derive(Default)]
pub struct InMemoryDriverStore {
    drivers: DashMap<Uuid, Driver>,
    sessions: DashMap<Uuid, Uuid>,
    history: Mutex<HashMap<Uuid, Vec<LocationSample>>>,
}

impl InMemoryDriverStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    pub fn list(&self) -> Vec<Driver> {
        self.drivers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn location_history(&self, driver_id: Uuid) -> Vec<LocationSample> {
        self.history.lock().get(&driver_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DriverLocator for InMemoryDriverStore {
    async fn find_nearby(&self, query: NearbyQuery) -> Result<Vec<NearbyDriver>, LocatorError> {
        if !crate::geo::valid_coordinates(query.latitude, query.longitude) {
            return Err(LocatorError::InvalidQuery(format!(
                "coordinates out of range: {}, {}",
                query.latitude, query.longitude
            )));
        }
        if query.radius_km.is_nan() || query.radius_km <= 0.0 {
            return Err(LocatorError::InvalidQuery("radius must be > 0".to_string()));
        }

        let origin = Location::new(query.latitude, query.longitude);
        let candidates = self
            .drivers
            .iter()
            .filter(|entry| {
                let driver = entry.value();
                driver.status == DriverStatus::Available && driver.category == query.category
            })
            .filter_map(|entry| {
                let driver = entry.value();
                let distance_km = haversine_km(&origin, &driver.location);
                (distance_km <= query.radius_km).then(|| NearbyDriver {
                    driver_id: driver.id,
                    distance_km,
                    rating: driver.rating,
                    last_known_location: driver.location.clone(),
                })
            })
            .collect();

        Ok(rank_candidates(candidates, query.limit))
    }

    async fn update_location(&self, driver_id: Uuid, location: Location) -> Result<(), LocatorError> {
        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            driver.location = location;
            driver.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl DriverRepository for InMemoryDriverStore {
    async fn get_driver(&self, driver_id: Uuid) -> Result<Driver, RepositoryError> {
        self.drivers
            .get(&driver_id)
            .map(|entry| entry.value().clone())
            .ok_or(RepositoryError::DriverNotFound(driver_id))
    }

    async fn update_driver_status(
        &self,
        driver_id: Uuid,
        status: DriverStatus,
    ) -> Result<Driver, RepositoryError> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or(RepositoryError::DriverNotFound(driver_id))?;

        driver.status = status;
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }

    async fn create_session(&self, driver_id: Uuid) -> Result<Uuid, RepositoryError> {
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, driver_id);
        Ok(session_id)
    }

    async fn end_session(&self, session_id: Uuid) -> Result<(), RepositoryError> {
        self.sessions.remove(&session_id);
        Ok(())
    }

    async fn record_location(&self, sample: LocationSample) -> Result<(), RepositoryError> {
        let mut history = self.history.lock();
        let samples = history.entry(sample.driver_id).or_default();
        if samples.len() >= LOCATION_HISTORY_LIMIT {
            samples.remove(0);
        }
        samples.push(sample);
        Ok(())
    }
}
