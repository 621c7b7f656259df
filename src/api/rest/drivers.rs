use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::rate_limiter::{LOCATION_UPDATE, RateLimitKey};
use crate::error::AppError;
use crate::models::driver::{Driver, DriverStatus, LocationSample};
use crate::models::ride::{Location, RideCategory};
use crate::ports::repository::DriverRepository;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(create_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/locations", get(location_history))
}

#[derive(Deserialize)]
pub struct CreateDriverRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub category: RideCategory,
    pub location: Location,
    #[serde(default = "default_rating")]
    pub rating: f64,
    #[serde(default = "default_status")]
    pub status: DriverStatus,
}

fn default_rating() -> f64 {
    5.0
}

fn default_status() -> DriverStatus {
    DriverStatus::Offline
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DriverStatus,
}

async fn create_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    if !payload.location.is_valid() {
        return Err(AppError::BadRequest("coordinates out of range".to_string()));
    }

    let driver = Driver {
        id: payload.id.unwrap_or_else(Uuid::new_v4),
        name: payload.name,
        category: payload.category,
        location: payload.location,
        status: payload.status,
        rating: payload.rating.clamp(0.0, 5.0),
        updated_at: Utc::now(),
    };

    state.drivers.upsert(driver.clone());
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    Json(state.drivers.list())
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    state.drivers.get_driver(id).await?;

    if payload.status == DriverStatus::Available {
        state.limiter.reset(RateLimitKey::new(id, LOCATION_UPDATE));
    }
    state
        .coordinator
        .set_driver_status(id, payload.status, None)
        .await;

    let driver = state.drivers.get_driver(id).await?;
    Ok(Json(driver))
}

async fn location_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LocationSample>>, AppError> {
    state.drivers.get_driver(id).await?;
    Ok(Json(state.drivers.location_history(id)))
}
