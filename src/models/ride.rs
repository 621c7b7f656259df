use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        crate::geo::valid_coordinates(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideCategory {
    Economy,
    Comfort,
    Premium,
    Xl,
}

impl RideCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideCategory::Economy => "economy",
            RideCategory::Comfort => "comfort",
            RideCategory::Premium => "premium",
            RideCategory::Xl => "xl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Matched,
    EnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 7] = [
        RideStatus::Requested,
        RideStatus::Matched,
        RideStatus::EnRoute,
        RideStatus::Arrived,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    /// The single status reachable from `self` along the forward chain.
    pub fn next(&self) -> Option<RideStatus> {
        match self {
            RideStatus::Requested => Some(RideStatus::Matched),
            RideStatus::Matched => Some(RideStatus::EnRoute),
            RideStatus::EnRoute => Some(RideStatus::Arrived),
            RideStatus::Arrived => Some(RideStatus::InProgress),
            RideStatus::InProgress => Some(RideStatus::Completed),
            RideStatus::Completed | RideStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            RideStatus::Requested | RideStatus::Matched | RideStatus::EnRoute | RideStatus::Arrived
        )
    }

    /// Statuses in which a ride must carry a driver id.
    pub fn has_driver(&self) -> bool {
        matches!(
            self,
            RideStatus::Matched
                | RideStatus::EnRoute
                | RideStatus::Arrived
                | RideStatus::InProgress
                | RideStatus::Completed
        )
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::EnRoute => "EN_ROUTE",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: RideStatus,
    pub category: RideCategory,
    pub pickup: Location,
    pub destination: Location,
    pub estimated_fare: f64,
    pub final_fare: Option<f64>,
    pub requested_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl Ride {
    pub fn new(
        passenger_id: Uuid,
        category: RideCategory,
        pickup: Location,
        destination: Location,
        estimated_fare: f64,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            ride_number: ride_number(&id),
            passenger_id,
            driver_id: None,
            status: RideStatus::Requested,
            category,
            pickup,
            destination,
            estimated_fare,
            final_fare: None,
            requested_at: Utc::now(),
            matched_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }
}

/// Short human-facing reference shown to drivers, e.g. `RD-1A2B3C4D`.
pub fn ride_number(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("RD-{}", simple[..8].to_uppercase())
}
