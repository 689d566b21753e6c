//! Retry policies.
//!
//! Named policies mirror what callers configure on a webhook: `none` gives a
//! single attempt, `linear` five attempts five seconds apart, `standard`
//! (the default) ten attempts with exponential backoff from one second.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn linear() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::Fixed { delay_ms: 5_000 },
        }
    }

    pub fn standard() -> Self {
        Self {
            attempts: 10,
            backoff: Backoff::Exponential { base_ms: 1_000 },
        }
    }

    /// The schedule used for every push job.
    pub fn push() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { base_ms: 1_000 },
        }
    }

    /// Resolves a named policy; unknown names fall back to `standard`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "none" => Self::none(),
            "linear" => Self::linear(),
            _ => Self::standard(),
        }
    }

    /// Delay before the next delivery, given the number of attempts already
    /// made. `None` when the budget is exhausted.
    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.attempts {
            return None;
        }
        let delay = match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms } => {
                let shift = attempts_made.saturating_sub(1).min(16);
                Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
            }
        };
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_gives_single_attempt() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.delay_after(1), None);
    }

    #[test]
    fn linear_is_fixed_five_seconds() {
        let policy = RetryPolicy::linear();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(5), None);
    }

    #[test]
    fn standard_doubles_from_one_second() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(9), Some(Duration::from_secs(256)));
        assert_eq!(policy.delay_after(10), None);
    }

    #[test]
    fn push_policy_is_three_exponential_attempts() {
        let policy = RetryPolicy::push();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn unknown_names_default_to_standard() {
        assert_eq!(RetryPolicy::from_name("bogus"), RetryPolicy::standard());
        assert_eq!(RetryPolicy::from_name("none"), RetryPolicy::none());
        assert_eq!(RetryPolicy::from_name("linear"), RetryPolicy::linear());
    }
}
