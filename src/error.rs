use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Chain indexer error: {0}")]
    Indexer(String),

    #[error("Transaction verification failed: {0}")]
    VerificationFailed(String),

    #[error("Settlement commit failed: {0}")]
    CommitFailed(String),

    #[error("Cache operation timed out")]
    CacheTimeout,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Redis(_) | AppError::CacheTimeout => {
                (StatusCode::SERVICE_UNAVAILABLE, "CACHE_ERROR")
            }
            AppError::Indexer(_) => (StatusCode::BAD_GATEWAY, "INDEXER_ERROR"),
            AppError::VerificationFailed(_) => (StatusCode::BAD_REQUEST, "VERIFICATION_FAILED"),
            AppError::CommitFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "COMMIT_FAILED"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            AppError::VerificationFailed(reason)
            | AppError::CommitFailed(reason)
            | AppError::Conflict(reason)
            | AppError::NotFound(reason)
            | AppError::BadRequest(reason) => reason.clone(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
