use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ride::{Location, RideCategory, RideStatus};

/// Inbound work item for the dispatch coordinator (`driver_matching` queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub ride_id: Uuid,
    pub pickup: Location,
    pub category: RideCategory,
    #[serde(default)]
    pub max_radius_km: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: Uuid,
}

/// Upper bound on a per-request offer timeout.
pub const MAX_OFFER_TIMEOUT_SECS: u64 = 3600;

impl MatchRequest {
    /// Rejects requests no dispatch cycle could run: bad pickup, empty
    /// search area, or an offer window outside `1..=MAX_OFFER_TIMEOUT_SECS`.
    pub fn validate(&self) -> Result<(), String> {
        if !self.pickup.is_valid() {
            return Err("pickup coordinates out of range".to_string());
        }
        if let Some(radius) = self.max_radius_km {
            if !radius.is_finite() || radius <= 0.0 {
                return Err("max_radius_km must be > 0".to_string());
            }
        }
        if let Some(secs) = self.timeout_secs {
            if secs == 0 || secs > MAX_OFFER_TIMEOUT_SECS {
                return Err(format!(
                    "timeout_secs must be within 1..={MAX_OFFER_TIMEOUT_SECS}"
                ));
            }
        }
        Ok(())
    }
}

/// Why a dispatch cycle ended without a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    NoDriversAvailable,
    Timeout,
    AllDeclined,
    RideCancelled,
    /// The cycle could not run: bad request, missing ride, or a failing
    /// collaborator.
    DispatchFailed,
}

/// Published on `driver.response.{rideID}` once per dispatch cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMatchOutcome {
    pub ride_id: Uuid,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnmatchedReason>,
    pub correlation_id: Uuid,
    pub decided_at: DateTime<Utc>,
}

impl DriverMatchOutcome {
    pub fn matched(ride_id: Uuid, driver_id: Uuid, correlation_id: Uuid) -> Self {
        Self {
            ride_id,
            accepted: true,
            driver_id: Some(driver_id),
            reason: None,
            correlation_id,
            decided_at: Utc::now(),
        }
    }

    pub fn unmatched(ride_id: Uuid, reason: UnmatchedReason, correlation_id: Uuid) -> Self {
        Self {
            ride_id,
            accepted: false,
            driver_id: None,
            reason: Some(reason),
            correlation_id,
            decided_at: Utc::now(),
        }
    }
}

/// Externally driven status transition (`ride_status` queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideStatusUpdate {
    pub ride_id: Uuid,
    pub status: RideStatus,
    #[serde(default)]
    pub driver_id: Option<Uuid>,
    #[serde(default)]
    pub final_fare: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{MAX_OFFER_TIMEOUT_SECS, MatchRequest};
    use crate::models::ride::{Location, RideCategory};
    use uuid::Uuid;

    fn request() -> MatchRequest {
        MatchRequest {
            ride_id: Uuid::new_v4(),
            pickup: Location::new(52.52, 13.405),
            category: RideCategory::Economy,
            max_radius_km: None,
            timeout_secs: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn offer_window_is_bounded() {
        let mut req = request();
        req.timeout_secs = Some(0);
        assert!(req.validate().is_err());

        req.timeout_secs = Some(MAX_OFFER_TIMEOUT_SECS);
        assert!(req.validate().is_ok());

        req.timeout_secs = Some(10_000_000_000_000);
        assert!(req.validate().is_err());
    }

    #[test]
    fn search_radius_must_be_positive() {
        let mut req = request();
        for radius in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            req.max_radius_km = Some(radius);
            assert!(req.validate().is_err(), "radius {radius} accepted");
        }
    }
}
