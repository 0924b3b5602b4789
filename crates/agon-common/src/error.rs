//! Error types shared by Agon services.

use deadpool_redis::redis::RedisError;
use thiserror::Error;

/// Main error type for the queue and store plumbing used by Agon services.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Payload or argument failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Redis command failed
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Stream/queue protocol error
    #[error("Queue error: {0}")]
    QueueError(String),

    /// External service error
    #[error("External service error: {0}")]
    ExternalServiceError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether redelivering the job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::CacheError(_)
                | AppError::QueueError(_)
                | AppError::ExternalServiceError(_)
                | AppError::TimeoutError(_)
                | AppError::InternalError(_)
        )
    }

    /// Returns the error code string for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::CacheError(_) => "CACHE_ERROR",
            AppError::QueueError(_) => "QUEUE_ERROR",
            AppError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::SerializationError(_) => "SERIALIZATION_ERROR",
            AppError::TimeoutError(_) => "TIMEOUT_ERROR",
            AppError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<RedisError> for AppError {
    fn from(e: RedisError) -> Self {
        AppError::CacheError(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for AppError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        AppError::CacheError(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SerializationError(e.to_string())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// What the queue layer should do with a job once a worker step returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Job finished; remove it from the stream.
    Completed,
    /// Transient failure; redeliver with backoff until retries run out.
    Retryable(String),
    /// Permanent failure; move straight to the dead-letter stream.
    Fatal(String),
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Retryable(_) => "retryable",
            Disposition::Fatal(_) => "fatal",
        }
    }
}

impl From<AppError> for Disposition {
    fn from(e: AppError) -> Self {
        if e.is_retryable() {
            Disposition::Retryable(e.to_string())
        } else {
            Disposition::Fatal(e.to_string())
        }
    }
}
