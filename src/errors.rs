//! The service-wide error taxonomy (§7).
//!
//! Mirrors `auth::api::AuthApiError`: one flat enum, one `IntoResponse`
//! match arm per variant, stable `code` strings returned verbatim to
//! callers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone)]
pub enum ApiError {
    SessionExists,
    SessionNotActive,
    PcOffline,
    PcNotFound,
    InsufficientFunds,
    TokenInvalid,
    TokenExpired,
    TokenConsumed,
    Forbidden,
    Unauthorized,
    ScheduleConflict,
    RateLimited,
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionExists => "SESSION_EXISTS",
            ApiError::SessionNotActive => "SESSION_NOT_ACTIVE",
            ApiError::PcOffline => "PC_OFFLINE",
            ApiError::PcNotFound => "PC_NOT_FOUND",
            ApiError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ApiError::TokenInvalid => "TOKEN_INVALID",
            ApiError::TokenExpired => "TOKEN_EXPIRED",
            ApiError::TokenConsumed => "TOKEN_CONSUMED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::ScheduleConflict => "SCHEDULE_CONFLICT",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionExists => StatusCode::CONFLICT,
            ApiError::SessionNotActive => StatusCode::CONFLICT,
            ApiError::PcOffline => StatusCode::CONFLICT,
            ApiError::PcNotFound => StatusCode::NOT_FOUND,
            ApiError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ApiError::TokenInvalid => StatusCode::NOT_FOUND,
            ApiError::TokenExpired => StatusCode::GONE,
            ApiError::TokenConsumed => StatusCode::CONFLICT,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::ScheduleConflict => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Internal(m) => m.clone(),
            other => other.code().to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.code(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

/// Translate a rusqlite error into the stable taxonomy. The session-slot
/// and queue-slot partial unique indexes (§4.1/§4.2) surface as
/// `SQLITE_CONSTRAINT` violations; we only special-case that one, everything
/// else is `Internal`.
impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref e, _) = err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return ApiError::SessionExists;
            }
        }
        ApiError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
