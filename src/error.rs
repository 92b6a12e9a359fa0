//! HTTP-facing error type.
//!
//! Every handler returns `Result<_, ApiError>`; the conversion to a response
//! picks the status code and renders `{"error": "<message>"}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::distro::DistroError;
use crate::metrics::CollectorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::WrongTokenClass) => StatusCode::FORBIDDEN,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Collector(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DistroError> for ApiError {
    fn from(e: DistroError) -> Self {
        match e {
            DistroError::InvalidName(_) | DistroError::InvalidPort { .. } => {
                Self::Validation(e.to_string())
            }
            DistroError::NameTaken(_) | DistroError::PortTaken(_) => Self::Conflict(e.to_string()),
            DistroError::NotFound(_) => Self::NotFound(e.to_string()),
            DistroError::Tool(_) | DistroError::Timeout | DistroError::BadOutput(_) => {
                Self::Upstream(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{status}: {self}");
        } else if !matches!(self, Self::Auth(_)) {
            warn!("{status}: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(AuthError::InvalidToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::WrongTokenClass).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Upstream("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(CollectorError::Unavailable("proc".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_distro_errors_map_to_client_or_upstream() {
        assert_eq!(
            ApiError::from(DistroError::NameTaken("ubuntu".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(DistroError::NotFound("ubuntu".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(DistroError::Timeout).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
