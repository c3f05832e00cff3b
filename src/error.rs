//! HTTP-facing error type.
//!
//! Every route returns `Result<_, AppError>`; the `IntoResponse` impl renders
//! the JSON error envelope `{error, message, code, ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Insufficient balance")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("{} does not have a bank account yet", recipient_label(.name, .email))]
    RecipientHasNoAccount { name: Option<String>, email: String },

    #[error("Cannot delete account with {0} pending transaction(s)")]
    PendingTransactions(i64),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many requests, slow down")]
    RateLimited,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InsufficientBalance { .. }
            | AppError::RecipientHasNoAccount { .. }
            | AppError::PendingTransactions(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            AppError::RecipientHasNoAccount { .. } => "RECIPIENT_NO_ACCOUNT",
            AppError::PendingTransactions(_) => "PENDING_TRANSACTIONS",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Short label for the `error` field of the envelope.
    fn label(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Invalid request",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Forbidden(_) => "Forbidden",
            AppError::NotFound(_) => "Not found",
            AppError::InsufficientBalance { .. } => "Insufficient balance",
            AppError::RecipientHasNoAccount { .. } => "Recipient has no bank account",
            AppError::PendingTransactions(_) => "Account has pending transactions",
            AppError::Conflict(_) => "Conflict",
            AppError::RateLimited => "Too many requests",
            AppError::Upstream(_) => "Upstream service error",
            AppError::ServiceUnavailable(_) => "Service unavailable",
            AppError::Internal(_) => "Internal server error",
        }
    }

    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("error".into(), json!(self.label()));
        body.insert("message".into(), json!(self.to_string()));
        body.insert("code".into(), json!(self.code()));

        match self {
            AppError::InsufficientBalance {
                available,
                required,
            } => {
                body.insert("available".into(), decimal_json(*available));
                body.insert("required".into(), decimal_json(*required));
            }
            AppError::RecipientHasNoAccount { name, email } => {
                body.insert(
                    "recipient".into(),
                    json!({ "name": name, "email": email }),
                );
            }
            AppError::PendingTransactions(count) => {
                body.insert("pendingCount".into(), json!(count));
            }
            _ => {}
        }

        Value::Object(body)
    }
}

fn recipient_label<'a>(name: &'a Option<String>, email: &'a str) -> &'a str {
    name.as_deref().unwrap_or(email)
}

fn decimal_json(value: Decimal) -> Value {
    value.to_f64().map(|v| json!(v)).unwrap_or(Value::Null)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(detail) = &self {
            tracing::error!(%detail, "request failed");
        }
        let status = self.status();
        let body = match self {
            // Never leak store or driver details to clients
            AppError::Internal(_) => AppError::Internal("Something went wrong".into()).body(),
            other => other.body(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::InsufficientBalance {
                available,
                required,
            } => AppError::InsufficientBalance {
                available,
                required,
            },
            StoreError::PendingTransactions(count) => AppError::PendingTransactions(count),
            other => AppError::Internal(other.to_string()),
        }
    }
}
