//! Frames exchanged with drivers over the real-time channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ride::{Location, Ride};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RideResponse {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_degrees: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Auth { token: String },
    RideResponse(RideResponse),
    LocationUpdate(LocationUpdate),
    /// Well-formed frame with a tag this server does not handle.
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid `{tag}` frame: {source}")]
    Payload {
        tag: String,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct AuthPayload {
    token: String,
}

impl InboundFrame {
    /// Decodes one text frame. The tag is read once and matched
    /// exhaustively; only structurally broken frames are errors.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        let payload_err = |source| FrameError::Payload {
            tag: tag.clone(),
            source,
        };

        match tag.as_str() {
            "auth" => {
                let auth: AuthPayload = serde_json::from_value(value).map_err(payload_err)?;
                Ok(InboundFrame::Auth { token: auth.token })
            }
            "ride_response" => serde_json::from_value(value)
                .map(InboundFrame::RideResponse)
                .map_err(payload_err),
            "location_update" => serde_json::from_value(value)
                .map(InboundFrame::LocationUpdate)
                .map_err(payload_err),
            _ => Ok(InboundFrame::Unknown(tag)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractionReason {
    /// Another driver accepted first.
    Claimed,
    Expired,
    Cancelled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideOfferFrame {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub ride_number: String,
    pub pickup_location: Location,
    pub destination_location: Location,
    pub estimated_fare: f64,
    pub driver_earnings: f64,
    pub distance_to_pickup_km: f64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideDetailsFrame {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub pickup_location: Location,
    pub destination_location: Location,
    pub estimated_fare: f64,
    pub matched_at: Option<DateTime<Utc>>,
}

impl From<&Ride> for RideDetailsFrame {
    fn from(ride: &Ride) -> Self {
        Self {
            ride_id: ride.id,
            ride_number: ride.ride_number.clone(),
            passenger_id: ride.passenger_id,
            pickup_location: ride.pickup.clone(),
            destination_location: ride.destination.clone(),
            estimated_fare: ride.estimated_fare,
            matched_at: ride.matched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    AuthSuccess {
        driver_id: Uuid,
    },
    RideOffer(RideOfferFrame),
    RideDetails(RideDetailsFrame),
    RideUnavailable {
        ride_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer_id: Option<Uuid>,
        reason: RetractionReason,
    },
    RateLimited {
        operation: String,
        retry_after_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutboundFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(ride_id: Uuid, offer_id: Option<Uuid>, reason: RetractionReason) -> Self {
        OutboundFrame::RideUnavailable {
            ride_id,
            offer_id,
            reason,
        }
    }
}
