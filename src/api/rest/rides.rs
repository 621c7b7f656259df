use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::queue::enqueue_match_request;
use crate::error::AppError;
use crate::models::outcome::MatchRequest;
use crate::models::ride::{Location, Ride, RideCategory};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub passenger_id: Uuid,
    pub category: RideCategory,
    pub pickup: Location,
    pub destination: Location,
    pub estimated_fare: f64,
    #[serde(default)]
    pub max_radius_km: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct RideQuery {
    pub passenger_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CancelRideRequest {
    #[serde(default)]
    pub passenger_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRideRequest>,
) -> Result<Json<Ride>, AppError> {
    if !payload.pickup.is_valid() || !payload.destination.is_valid() {
        return Err(AppError::BadRequest("coordinates out of range".to_string()));
    }

    if !payload.estimated_fare.is_finite() || payload.estimated_fare < 0.0 {
        return Err(AppError::BadRequest("estimated_fare must be >= 0".to_string()));
    }

    let ride = Ride::new(
        payload.passenger_id,
        payload.category,
        payload.pickup,
        payload.destination,
        payload.estimated_fare,
    );
    let request = MatchRequest {
        ride_id: ride.id,
        pickup: ride.pickup.clone(),
        category: ride.category,
        max_radius_km: payload.max_radius_km,
        timeout_secs: payload.timeout_secs,
        correlation_id: Uuid::new_v4(),
    };
    request.validate().map_err(AppError::BadRequest)?;

    let ride = state.rides.create_ride(ride).await?;
    enqueue_match_request(&state.coordinator, request).await?;

    Ok(Json(ride))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RideQuery>,
) -> Result<Json<Ride>, AppError> {
    let ride = state.rides.get_ride(id, query.passenger_id).await?;
    Ok(Json(ride))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRideRequest>,
) -> Result<Json<Ride>, AppError> {
    let ride = state
        .coordinator
        .cancel_ride(id, payload.passenger_id, payload.reason)
        .await?;
    Ok(Json(ride))
}
