//! HTTP error mapping for the management and device surfaces.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::bus::BusError;
use crate::presence::PresenceError;
use crate::session::SessionError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Device not connected")]
    DeviceNotConnected,

    #[error("Device already connected")]
    DeviceAlreadyConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::DeviceNotConnected | Self::DeviceAlreadyConnected => {
                StatusCode::CONFLICT
            }
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "request_id": Uuid::new_v4().to_string(),
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound => Self::NotFound("Session".to_string()),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::InvalidSession(msg) => Self::InvalidRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::DeviceNotConnected => Self::DeviceNotConnected,
            SessionError::NotFound => Self::NotFound("Session".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<PresenceError> for ApiError {
    fn from(e: PresenceError) -> Self {
        match e {
            PresenceError::DeviceAlreadyConnected(_) => Self::DeviceAlreadyConnected,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::PresenceConflict(_) => Self::DeviceAlreadyConnected,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<fleetlink_proto::ProtoError> for ApiError {
    fn from(e: fleetlink_proto::ProtoError) -> Self {
        Self::Internal(e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::NotFound("Device".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::DeviceNotConnected.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::DeviceAlreadyConnected.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            ApiError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_errors_map_through() {
        assert!(matches!(
            ApiError::from(StoreError::SessionNotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::Conflict("dup".into())),
            ApiError::Conflict(_)
        ));
    }
}
