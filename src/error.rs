//! Error types for render-queue operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Submission validation
//! - Job lookup and lifecycle transitions
//! - Backend connectivity and storage failures
//! - Caller-side waiting (`wait_for_job`)
//!
//! Renderer failures live in [`crate::renderer::RenderError`] and worker pool
//! lifecycle failures in [`crate::scheduler::PoolError`].

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

/// Errors that can occur while submitting, querying or updating jobs.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Invalid transition for job {id} from '{from}' to '{to}'")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} is not owned by the caller (lease expired or reclaimed)")]
    LeaseMismatch(Uuid),

    #[error("Job {id} failed: {error}")]
    JobFailed { id: Uuid, error: String },

    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("Timed out after {timeout:?} waiting for job {id}")]
    WaitTimeout { id: Uuid, timeout: Duration },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend operation failed: {0}")]
    Backend(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Returns whether the error means the backend store could not be reached.
    ///
    /// Workers retry the backend call itself after these errors; every other
    /// variant is final for the operation that produced it.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            QueueError::BackendUnavailable(err.to_string())
        } else {
            QueueError::Backend(err.to_string())
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                QueueError::BackendUnavailable(err.to_string())
            }
            other => QueueError::Backend(other.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for QueueError {
    fn from(err: serde_yaml::Error) -> Self {
        QueueError::Config(err.to_string())
    }
}
