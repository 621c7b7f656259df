use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-bounded proposal of one ride to one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideOffer {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub estimated_fare: f64,
    pub driver_earnings: f64,
    pub distance_to_pickup_km: f64,
}

impl RideOffer {
    /// Offer ids are derived from the (driver, ride) pair so a redelivered
    /// offer keeps its identity.
    pub fn offer_id_for(ride_id: Uuid, driver_id: Uuid) -> Uuid {
        Uuid::from_u128(ride_id.as_u128() ^ driver_id.as_u128().rotate_left(64))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
