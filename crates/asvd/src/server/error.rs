//! Error envelope for the HTTP API.
//!
//! Every non-2xx response carries `{"error": "<message>"}` with
//! `Content-Type: application/json`, including timeouts.

use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use asv_core::DomainError;
use asv_protocol::ErrorBody;

use crate::deadline::DeadlineError;
use crate::store::StoreError;

/// Body of the guard response when a bounded request overran its budget.
pub const REQUEST_TIMED_OUT: &str = "request timed out";

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or rejected input (400)
    #[error("{0}")]
    BadRequest(String),

    /// Unknown session or route (404)
    #[error("{0}")]
    NotFound(String),

    /// Search requested but the index is missing (501)
    #[error("full-text search is not available")]
    FtsUnavailable,

    /// The handler's deadline fired (504)
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The request was cancelled by disconnect or shutdown (504)
    #[error("request cancelled")]
    Cancelled,

    /// The dispatcher gave up waiting for the handler (503)
    #[error("request timed out")]
    RequestTimedOut,

    /// Storage or other internal failure (500)
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::FtsUnavailable => StatusCode::NOT_IMPLEMENTED,
            Self::DeadlineExceeded | Self::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestTimedOut => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

impl From<DeadlineError> for ApiError {
    fn from(err: DeadlineError) -> Self {
        match err {
            DeadlineError::Exceeded => Self::DeadlineExceeded,
            DeadlineError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        Self::BadRequest(err.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            StoreError::Cancelled => Self::Cancelled,
            StoreError::NotFound(id) => Self::NotFound(format!("session not found: {id}")),
            StoreError::FtsUnavailable => Self::FtsUnavailable,
            StoreError::Validation(e) => Self::BadRequest(e.to_string()),
            other => {
                error!(error = %other, "Storage failure");
                Self::Internal(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asv_core::SessionId;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::FtsUnavailable.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ApiError::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::Cancelled.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::RequestTimedOut.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_store_errors_convert() {
        let err = ApiError::from(StoreError::NotFound(SessionId::new("abc")));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "session not found: abc");

        let err = ApiError::from(StoreError::Validation(DomainError::validation(
            "at least one filter is required",
        )));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "at least one filter is required");

        let err = ApiError::from(StoreError::Task("panicked".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_guard_message() {
        assert_eq!(ApiError::RequestTimedOut.to_string(), REQUEST_TIMED_OUT);
    }

    #[test]
    fn test_response_is_json() {
        let response = ApiError::DeadlineExceeded.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get(axum::http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
