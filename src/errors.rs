use axum::http::StatusCode;
use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Store operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Redis pool error: {0}")]
    RedisPoolError(String),

    #[error("Redis command error: {0}")]
    RedisCommandError(#[from] RedisError),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Env error: {0}")]
    EnvError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the failed operation may succeed if the caller retries it unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::DatabaseError(_)
                | AppError::Timeout(_)
                | AppError::RedisPoolError(_)
                | AppError::RedisCommandError(_)
        )
    }

    pub fn to_response(&self) -> (StatusCode, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::DatabaseError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not reach rating store".into(),
            ),
            AppError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Rating store did not answer in time".into(),
            ),
            AppError::RedisPoolError(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.clone()),
            AppError::RedisCommandError(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::MalformedMessage(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::EnvError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected server error".into(),
            ),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::DatabaseError(e.to_string())
    }
}

impl From<bb8::RunError<RedisError>> for AppError {
    fn from(e: bb8::RunError<RedisError>) -> Self {
        match e {
            bb8::RunError::User(err) => AppError::RedisCommandError(err),
            bb8::RunError::TimedOut => {
                AppError::RedisPoolError("Redis connection timed out".into())
            }
        }
    }
}
