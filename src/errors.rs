use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::GateDenied;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Insufficient {} balance: {} required, {} remaining", .0.point_type, .0.cost, .0.available())]
    InsufficientBalance(GateDenied),

    #[error("Concurrent update of account {0}")]
    StoreConflict(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Balance overflow for account {0}")]
    BalanceOverflow(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::AccountNotFound(_) | AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::UnknownFeature(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InsufficientBalance(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::AccountExists(_) => StatusCode::CONFLICT,
            AppError::StoreConflict(_) | AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match self {
            AppError::InsufficientBalance(ref denied) => json!({
                "success": false,
                "error": "Insufficient balance",
                "message": denied.message(),
                "pointType": denied.point_type,
                "cost": denied.cost,
                "pointsRemaining": denied.current_balance,
                "nextReplenishAt": denied.next_replenish_at,
            }),
            AppError::AccountNotFound(_) => json!({
                "success": false,
                "error": "Unauthorized",
                "message": "Account is not registered",
            }),
            AppError::Auth(ref msg) => json!({
                "success": false,
                "error": "Unauthorized",
                "message": msg,
            }),
            AppError::UnknownFeature(ref feature) => json!({
                "success": false,
                "error": "Validation failed",
                "message": format!("Unknown feature: {}", feature),
            }),
            AppError::Validation(ref msg) => json!({
                "success": false,
                "error": "Validation failed",
                "message": msg,
            }),
            AppError::AccountExists(_) => json!({
                "success": false,
                "error": "Conflict",
                "message": "Account already exists",
            }),
            AppError::StoreConflict(_) | AppError::Transient(_) => {
                tracing::warn!("Transient ledger failure: {}", self);
                json!({
                    "success": false,
                    "error": "Service unavailable",
                    "message": "Please try again in a moment",
                })
            }
            ref other => {
                tracing::error!("Request failed: {}", other);
                json!({
                    "success": false,
                    "error": "Internal server error",
                    "message": "Internal server error",
                })
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
