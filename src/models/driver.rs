use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ride::{Location, RideCategory};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Offline,
    Available,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub category: RideCategory,
    pub location: Location,
    pub status: DriverStatus,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

/// One row returned by the nearby-driver locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub driver_id: Uuid,
    pub distance_km: f64,
    pub rating: f64,
    pub last_known_location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Published on `driver.status.{driverID}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStatusEvent {
    pub driver_id: Uuid,
    pub status: DriverStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}
