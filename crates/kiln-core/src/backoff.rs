//! Requeue backoff policy.
//!
//! Work queues consult a [`BackoffConfig`] to decide how long a key that
//! failed reconciliation waits before it is handed to a worker again.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between retries.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    ///
    /// Attempt `0` is treated as the first attempt. Results never exceed the
    /// configured maximum, even when the exponential term overflows.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // clamped to i32::MAX below
                let exponent = steps.min(i32::MAX as u32) as i32;
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(delay_secs)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => increment
                .checked_mul(steps)
                .and_then(|extra| initial_delay.checked_add(extra))
                .unwrap_or(*max_delay)
                .min(*max_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_overflow_is_capped() {
        let config = BackoffConfig::default();
        assert_eq!(
            config.delay_for_attempt(u32::MAX),
            Duration::from_secs(1000)
        );
    }

    #[test]
    fn test_linear_backoff() {
        let config = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(9));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            backoff: BackoffConfig,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [backoff]
            type = "fixed"
            delay = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(
            parsed.backoff,
            BackoffConfig::Fixed {
                delay: Duration::from_millis(250)
            }
        );
    }
}
