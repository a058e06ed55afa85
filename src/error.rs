//! Unified error handling
//!
//! The budget and milestone services return `ApiError` directly so a handler
//! can hand the failure back to axum unchanged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but is not the party allowed to act.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cannot {operation} while {current}")]
    InvalidState { operation: String, current: String },

    #[error("Schedule incomplete: {remaining_hours} hours left to allocate")]
    IncompleteSchedule { remaining_hours: Decimal },

    #[error("Budget has no scheduled slots")]
    NoSchedule,

    #[error("Escrow provider error: {message}")]
    Escrow { retryable: bool, message: String },

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(operation: impl Into<String>, current: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            current: current.to_string(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::IncompleteSchedule { .. } | Self::NoSchedule => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Escrow { retryable: true, .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Escrow { retryable: false, .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IncompleteSchedule { .. } => "INCOMPLETE_SCHEDULE",
            Self::NoSchedule => "NO_SCHEDULE",
            Self::Escrow { retryable: true, .. } => "ESCROW_UNAVAILABLE",
            Self::Escrow { retryable: false, .. } => "ESCROW_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Don't leak internal error details
            Self::Internal(_) | Self::Database(_) => "An internal error occurred".to_string(),
            Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Validation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InvalidState { operation, current } => Some(serde_json::json!({
                "attempted": operation,
                "current_state": current,
            })),
            Self::IncompleteSchedule { remaining_hours } => Some(serde_json::json!({
                "remaining_hours": remaining_hours,
            })),
            Self::Escrow { retryable, .. } => Some(serde_json::json!({
                "retryable": retryable,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal server error");
            }
            Self::Database(e) => {
                tracing::error!(error = ?e, "Database error");
            }
            Self::Escrow { .. } => {
                tracing::error!(error = %self, "Escrow provider error");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.public_message(),
            details: self.details(),
            request_id: None,
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_errors_map_to_distinct_statuses() {
        assert_eq!(
            ApiError::invalid_state("approve budget", "APROBADO").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::IncompleteSchedule {
                remaining_hours: Decimal::new(2, 0)
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Escrow {
                retryable: true,
                message: "timeout".into()
            }
            .error_code(),
            "ESCROW_UNAVAILABLE"
        );
        assert_eq!(
            ApiError::Escrow {
                retryable: false,
                message: "rejected".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn invalid_state_reports_attempt_and_current_state() {
        let err = ApiError::invalid_state("release funds", "PAGADO");
        assert_eq!(err.to_string(), "Cannot release funds while PAGADO");
        let details = err.details().unwrap();
        assert_eq!(details["attempted"], "release funds");
        assert_eq!(details["current_state"], "PAGADO");
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = ApiError::internal("connection refused on 10.0.0.3");
        assert_eq!(err.public_message(), "An internal error occurred");
    }
}
