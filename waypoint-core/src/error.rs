use std::fmt;

use thiserror::Error;

/// External service a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Hosting,
    Generator,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hosting => write!(f, "repository hosting service"),
            Self::Generator => write!(f, "generative AI service"),
        }
    }
}

/// Errors surfaced by pipeline operations.
///
/// Malformed model output is deliberately absent: it is absorbed into a
/// degraded verdict by the analyzer and never reaches callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request is missing a required field or carries a malformed value.
    /// Always raised before any external call.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: Upstream, message: String },

    #[error("{service} rate limited: {message}")]
    RateLimited { service: Upstream, message: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
