//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::service::{StartError, Unsupported};

/// Errors surfaced by the HTTP control routes
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("ETL error: {0}")]
    Etl(#[from] cnpj_common::EtlError),
}

impl From<StartError> for AppError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::AlreadyRunning { .. } => AppError::Conflict(err.to_string()),
            StartError::ValidationFailed { .. } => AppError::PreconditionFailed(err.to_string()),
            StartError::InvalidRequest(message) => AppError::BadRequest(message),
            StartError::Database(e) => AppError::Database(e),
            StartError::Ingest(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<Unsupported> for AppError {
    fn from(err: Unsupported) -> Self {
        AppError::NotImplemented(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::PreconditionFailed(ref message) => {
                (StatusCode::PRECONDITION_FAILED, message.clone())
            },
            AppError::NotImplemented(ref message) => (StatusCode::NOT_IMPLEMENTED, message.clone()),
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
            AppError::Etl(ref e) => {
                tracing::error!("ETL error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            },
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::Conflict("busy".into()), StatusCode::CONFLICT),
            (AppError::PreconditionFailed("disk".into()), StatusCode::PRECONDITION_FAILED),
            (AppError::NotImplemented("pause".into()), StatusCode::NOT_IMPLEMENTED),
            (AppError::NotFound("job".into()), StatusCode::NOT_FOUND),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
