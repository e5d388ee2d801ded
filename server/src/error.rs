//! Error types for EchoVault
//!
//! All errors use thiserror for structured error handling.
//! At the HTTP boundary they are rendered as `{"error": "..."}` JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Input rejected by the time arithmetic, recurring pattern or panic
/// config constructors. Returned to callers as a typed value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Reminder offset must be greater than zero")]
    ZeroDuration,

    #[error("Minutes must be a multiple of 15 (got {0})")]
    NonQuarterInterval(u32),

    #[error("Reminder of {offset} minutes must be shorter than the {max} minute deadline")]
    ExceedsThreshold { offset: u32, max: u32 },

    #[error("A reminder {0} minutes before the deadline already exists")]
    DuplicateReminder(u32),

    #[error("Recurring interval must be at least 1")]
    InvalidInterval,

    #[error("Day {day} is out of range for a {kind} pattern")]
    DayOutOfRange { kind: &'static str, day: u32 },

    #[error("Month {0} is out of range (0-11)")]
    MonthOutOfRange(u32),

    #[error("Cancel window of {0} seconds is not allowed")]
    InvalidCancelWindow(u32),

    #[error("An enabled panic trigger needs at least one method")]
    NoPanicMethods,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Condition not found: {0}")]
    ConditionNotFound(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Delivery failed: {0}")]
    TransientDelivery(String),

    #[error("Invalid condition {id}: {reason}")]
    InvalidCondition { id: String, reason: String },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidCondition { .. } => StatusCode::BAD_REQUEST,
            AppError::MessageNotFound(_)
            | AppError::ConditionNotFound(_)
            | AppError::DeliveryNotFound(_)
            | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::TransientDelivery(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
