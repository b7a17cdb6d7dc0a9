//! Queue and handler error types.

use herald_common::AppError;
use thiserror::Error;

/// Errors raised by the queue machinery itself.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend storage failure.
    #[error("Redis error: {0}")]
    Redis(String),

    /// A stored task or state value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A task could not be built from its options.
    #[error("Invalid task: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<fred::error::Error> for QueueError {
    fn from(err: fred::error::Error) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Redis(msg) => Self::Redis(msg),
            QueueError::Serialization(msg) | QueueError::Invalid(msg) => Self::Queue(msg),
        }
    }
}

/// Result of a task handler that did not succeed.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Try again later with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Drop the task without retrying.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl TaskError {
    /// Whether the queue should schedule another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<AppError> for TaskError {
    fn from(err: AppError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Terminal(err.to_string())
        }
    }
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        Self::Retryable(err.to_string())
    }
}
