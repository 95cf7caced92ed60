//! Text generation with retry, backoff and model-tier fallback.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::backoff::{BackoffPolicy, FailureKind, ModelTiers, RetryDecision, Tier};
use crate::error::{PipelineError, Upstream};

/// Failure of a single generation call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("model {model} is rate limited: {message}")]
    RateLimited { model: String, message: String },

    #[error("model {model} failed: {message}")]
    Unavailable { model: String, message: String },
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Unavailable { .. } => FailureKind::Other,
        }
    }
}

impl From<GenerationError> for PipelineError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::RateLimited { .. } => PipelineError::RateLimited {
                service: Upstream::Generator,
                message: err.to_string(),
            },
            GenerationError::Unavailable { .. } => PipelineError::UpstreamUnavailable {
                service: Upstream::Generator,
                message: err.to_string(),
            },
        }
    }
}

/// A text-completion backend addressed by model name.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn generate(
        &self,
        correlation_id: Option<&str>,
        model: &str,
        prompt: &str,
    ) -> Result<String, GenerationError>;
}

/// Wraps a [`TextBackend`] with the [`BackoffPolicy`].
pub struct ContentGenerator {
    backend: Arc<dyn TextBackend>,
    tiers: ModelTiers,
}

impl ContentGenerator {
    pub fn new(backend: Arc<dyn TextBackend>, tiers: ModelTiers) -> Self {
        Self { backend, tiers }
    }

    pub fn tiers(&self) -> &ModelTiers {
        &self.tiers
    }

    /// Generate text for `prompt`, making at most `max_attempts` calls.
    ///
    /// Backoff delays are slept on the calling task. On exhaustion the error
    /// of the last attempt is returned.
    pub async fn generate(
        &self,
        correlation_id: Option<&str>,
        prompt: &str,
        max_attempts: u32,
    ) -> Result<String, GenerationError> {
        let policy = BackoffPolicy::new(max_attempts, &self.tiers);
        let mut tier = Tier::Primary;
        let mut attempt = 0u32;

        loop {
            let model = self.tiers.model(tier);
            info!(
                "Generation attempt {} of {} using model {}",
                attempt + 1,
                policy.max_attempts(),
                model
            );

            let err = match self.backend.generate(correlation_id, model, prompt).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            warn!(
                "Generation attempt {} with model {} failed: {}",
                attempt + 1,
                model,
                err
            );

            match policy.decide(attempt, err.kind(), tier) {
                RetryDecision::Exhausted => return Err(err),
                RetryDecision::Retry { tier: next, delay } => {
                    if next != tier {
                        info!(
                            "Rate limited on {}, falling back to {}",
                            model,
                            self.tiers.model(next)
                        );
                    } else {
                        info!("Backing off for {:?} before retry", delay);
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    tier = next;
                }
            }

            attempt += 1;
        }
    }
}
