use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

use crate::types::ErrorResponse;

/// Errors raised while serving a request. Every variant renders as
/// `{"error": message}` with the matching status code.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Database failure. The detail is logged, never sent.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Any other failure (token signing, hashing). Logged, never sent.
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the caller.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Store(_) | ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

// Store methods return anyhow; a database error inside still maps to `Store`.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(e) => ApiError::Store(e),
            Err(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Store(e) => error!("Request failed: {}", e),
            ApiError::Internal(e) => error!("Request failed: {:#}", e),
            _ => {}
        }
        (
            self.status(),
            Json(ErrorResponse {
                error: self.public_message(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_anyhow_errors_are_split_by_source() {
        let store: ApiError = anyhow::Error::from(sqlx::Error::RowNotFound).into();
        assert!(matches!(store, ApiError::Store(sqlx::Error::RowNotFound)));

        let internal: ApiError = anyhow!("Failed to issue token: bad key").into();
        assert!(matches!(internal, ApiError::Internal(_)));

        for e in [store, internal] {
            assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(e.public_message(), "Internal server error");
        }
    }

    #[test]
    fn test_client_errors_keep_their_message() {
        let e = ApiError::Conflict("Email is already in use".to_string());
        assert_eq!(e.status(), StatusCode::CONFLICT);
        assert_eq!(e.public_message(), "Email is already in use");
    }
}
