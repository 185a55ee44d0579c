use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Caller-visible service error.
///
/// `Misconfigured` is a startup-time condition (500); `Unavailable` covers
/// every runtime pool, connection or credential failure (503).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Misconfigured(String),

    #[error("{0}")]
    Unavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl ServiceError {
    pub fn misconfigured(detail: impl Into<String>) -> Self {
        ServiceError::Misconfigured(detail.into())
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        ServiceError::Unavailable(detail.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ServiceError::Misconfigured(detail) | ServiceError::Unavailable(detail) => detail,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        tracing::error!(
            status = %status.as_u16(),
            detail = %self.detail(),
            "Service error"
        );

        let body = ErrorResponse {
            detail: self.detail().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
