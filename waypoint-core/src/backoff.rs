//! Retry and model-tier downgrade policy for generation calls.
//!
//! The policy is a pure function so it can be tested without a network:
//! given the index of the attempt that just failed, how it failed and which
//! tier it ran on, it decides the tier and delay of the next attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PRIMARY_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_FALLBACK_MODEL: &str = "gemini-1.0-pro-latest";

/// How a failed attempt is classified for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Other,
}

/// Position in the tier sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Primary,
    Fallback,
}

/// The model tiers tried, in order. At most one downgrade happens, from the
/// primary to the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTiers {
    pub primary: String,
    pub fallback: Option<String>,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback: Some(DEFAULT_FALLBACK_MODEL.to_string()),
        }
    }
}

impl ModelTiers {
    pub fn single(model: impl Into<String>) -> Self {
        Self {
            primary: model.into(),
            fallback: None,
        }
    }

    /// Parse a comma-separated list such as `"gemini-1.5-flash,gemini-1.0-pro-latest"`.
    ///
    /// Returns `None` when the list names no model. Entries beyond the second
    /// are ignored since only one downgrade is ever taken.
    pub fn parse_list(raw: &str) -> Option<Self> {
        let mut models = raw.split(',').map(str::trim).filter(|m| !m.is_empty());
        let primary = models.next()?.to_string();
        let fallback = models.next().map(str::to_string);
        Some(Self { primary, fallback })
    }

    pub fn model(&self, tier: Tier) -> &str {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Fallback => self.fallback.as_deref().unwrap_or(&self.primary),
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { tier: Tier, delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    can_downgrade: bool,
}

impl BackoffPolicy {
    /// `max_attempts` is a hard ceiling; values below one are raised to one.
    pub fn new(max_attempts: u32, tiers: &ModelTiers) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            can_downgrade: tiers.has_fallback(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the next step after attempt `attempt` (zero-based) failed with
    /// `kind` while running on `tier`.
    ///
    /// A rate limit on the primary tier downgrades immediately with no delay.
    /// Everything else backs off `2^attempt` seconds on the same tier.
    pub fn decide(&self, attempt: u32, kind: FailureKind, tier: Tier) -> RetryDecision {
        if attempt.saturating_add(1) >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        if kind == FailureKind::RateLimited && tier == Tier::Primary && self.can_downgrade {
            return RetryDecision::Retry {
                tier: Tier::Fallback,
                delay: Duration::ZERO,
            };
        }

        RetryDecision::Retry {
            tier,
            delay: exponential_delay(attempt),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, &ModelTiers::default())
    }
}

/// `2^attempt` seconds, saturating for absurd attempt counts.
pub fn exponential_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rate_limit_on_primary_downgrades_without_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.decide(0, FailureKind::RateLimited, Tier::Primary),
            RetryDecision::Retry {
                tier: Tier::Fallback,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_second_failure_backs_off_without_downgrading_again() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.decide(1, FailureKind::RateLimited, Tier::Fallback),
            RetryDecision::Retry {
                tier: Tier::Fallback,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(1, FailureKind::Other, Tier::Fallback),
            RetryDecision::Retry {
                tier: Tier::Fallback,
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_other_failure_backs_off_on_current_tier() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.decide(0, FailureKind::Other, Tier::Primary),
            RetryDecision::Retry {
                tier: Tier::Primary,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_rate_limit_after_other_failure_still_downgrades_once() {
        let policy = BackoffPolicy::new(4, &ModelTiers::default());
        assert_eq!(
            policy.decide(1, FailureKind::RateLimited, Tier::Primary),
            RetryDecision::Retry {
                tier: Tier::Fallback,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_no_fallback_means_no_downgrade() {
        let policy = BackoffPolicy::new(3, &ModelTiers::single("gemini-1.5-pro"));
        assert_eq!(
            policy.decide(0, FailureKind::RateLimited, Tier::Primary),
            RetryDecision::Retry {
                tier: Tier::Primary,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_last_attempt_is_exhausted() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.decide(2, FailureKind::Other, Tier::Fallback),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = BackoffPolicy::new(0, &ModelTiers::default());
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(
            policy.decide(0, FailureKind::RateLimited, Tier::Primary),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_parse_model_list() {
        let tiers = ModelTiers::parse_list(" a , b, c").unwrap();
        assert_eq!(tiers.primary, "a");
        assert_eq!(tiers.fallback.as_deref(), Some("b"));
        assert_eq!(ModelTiers::parse_list("solo").unwrap().fallback, None);
        assert!(ModelTiers::parse_list(" , ").is_none());
    }

    fn arb_kind() -> impl Strategy<Value = FailureKind> {
        prop_oneof![Just(FailureKind::RateLimited), Just(FailureKind::Other)]
    }

    proptest! {
        /// Simulating an always-failing operation never exceeds the attempt
        /// ceiling and downgrades at most once.
        #[test]
        fn never_exceeds_ceiling(max in 0u32..10, kinds in proptest::collection::vec(arb_kind(), 10)) {
            let policy = BackoffPolicy::new(max, &ModelTiers::default());
            let mut tier = Tier::Primary;
            let mut attempts = 0u32;
            let mut downgrades = 0u32;

            loop {
                let kind = kinds[attempts as usize % kinds.len()];
                attempts += 1;
                match policy.decide(attempts - 1, kind, tier) {
                    RetryDecision::Exhausted => break,
                    RetryDecision::Retry { tier: next, delay } => {
                        if next != tier {
                            downgrades += 1;
                            prop_assert_eq!(delay, Duration::ZERO);
                        } else {
                            prop_assert_eq!(delay, exponential_delay(attempts - 1));
                        }
                        tier = next;
                    }
                }
            }

            prop_assert_eq!(attempts, max.max(1));
            prop_assert!(downgrades <= 1);
        }
    }
}
