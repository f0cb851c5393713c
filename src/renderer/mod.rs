//! Renderer seam.
//!
//! The queue never interprets a [`RenderPayload`]; workers hand it to a
//! [`Renderer`] and only look at the outcome. Errors are retryable unless
//! the renderer reports them as [`RenderError::Permanent`].

mod template;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::job::RenderPayload;

pub use template::TeraFileRenderer;

/// Errors reported by a renderer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// Transient failure; the job is retried while it has retries left.
    #[error("render failed: {0}")]
    Failed(String),

    /// Failure that no retry can fix, such as a broken template.
    #[error("permanent render failure: {0}")]
    Permanent(String),
}

impl RenderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Turns a payload into an output document.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders the payload and returns the path of the produced file.
    async fn render(&self, payload: &RenderPayload) -> Result<PathBuf, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_retryable() {
        assert!(RenderError::failed("disk full").is_retryable());
        assert!(!RenderError::permanent("bad template").is_retryable());
    }

    #[test]
    fn test_render_error_display() {
        let err = RenderError::permanent("unknown filter");
        assert!(err.to_string().contains("permanent"));
        assert!(err.to_string().contains("unknown filter"));
    }
}
