use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ride::RideStatus;
use crate::ports::auth::Role;

/// State machine guard violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },

    #[error("ride cannot be cancelled while {status}")]
    CannotCancel { status: RideStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("role {actual} not permitted, expected {expected}")]
    WrongRole { expected: Role, actual: Role },

    #[error("authentication timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("delivery to driver {driver_id} failed")]
    DeliveryFailed { driver_id: Uuid },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("ride {0} not found")]
    RideNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("invalid search area: {0}")]
    InvalidQuery(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish to {exchange}/{routing_key} failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("subscribe to {queue} failed: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returned by broker delivery handlers; decides ack/requeue/reject.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload could not be parsed; rejected without requeue.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Processing failed; the delivery is requeued.
    #[error("transient failure: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ride {0} not found")]
    RideNotFound(Uuid),

    #[error("invalid match request: {0}")]
    InvalidRequest(String),

    #[error("match queue closed")]
    QueueClosed,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Locator(#[from] LocatorError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        AppError::Conflict(err.to_string())
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::RideNotFound(_) | RepositoryError::DriverNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            RepositoryError::Transition(inner) => inner.into(),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::RideNotFound(_) => AppError::NotFound(err.to_string()),
            DispatchError::InvalidRequest(msg) => AppError::BadRequest(msg),
            DispatchError::Repository(inner) => inner.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
