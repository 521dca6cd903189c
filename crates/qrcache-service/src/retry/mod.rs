//! Retrying of fallible async operations with exponential backoff.
//!
//! A [`RetryConfig`] describes how often and how patiently an operation is retried, and
//! [`execute_with_retry`] drives an operation according to it. Whether an error is worth
//! another attempt is decided by the error itself, through the [`Retryable`] trait.

use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub mod backoff;

/// Classifies errors into transient and terminal ones.
pub trait Retryable {
    /// Whether trying the same operation again might succeed.
    fn is_retryable(&self) -> bool;

    /// The error reported when all attempts were used up without a more specific error.
    fn exhausted() -> Self
    where
        Self: Sized;
}

/// Rejected parameters of a [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRetryConfig {
    #[error("backoff multiplier must be greater than 1.0, got {0}")]
    Multiplier(f64),
    #[error("max delay {max:?} is smaller than base delay {base:?}")]
    MaxDelay { base: Duration, max: Duration },
    #[error("jitter range {low}..{high} is not within [0, 1)")]
    Jitter { low: f64, high: f64 },
}

/// An immutable retry policy.
///
/// `max_retries` is the total number of attempts, where `0` still means a single attempt.
/// The delay before attempt `n + 1` is computed by [`backoff::delay`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_low: f64,
    jitter_high: f64,
}

impl RetryConfig {
    /// The general purpose policy.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter_low: 0.0,
        jitter_high: 0.1,
    };

    /// More attempts in quicker succession, for requests the user is actively waiting on.
    pub const AGGRESSIVE: Self = Self {
        max_retries: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 1.5,
        jitter_low: 0.0,
        jitter_high: 0.2,
    };

    /// Few, spaced out attempts, for background work.
    pub const CONSERVATIVE: Self = Self {
        max_retries: 2,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        jitter_low: 0.0,
        jitter_high: 0.05,
    };

    /// Creates a custom policy, validating its parameters.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter: Range<f64>,
    ) -> Result<Self, InvalidRetryConfig> {
        // written this way to also reject NaN
        if !(backoff_multiplier > 1.0 && backoff_multiplier.is_finite()) {
            return Err(InvalidRetryConfig::Multiplier(backoff_multiplier));
        }
        if max_delay < base_delay {
            return Err(InvalidRetryConfig::MaxDelay {
                base: base_delay,
                max: max_delay,
            });
        }
        let Range { start, end } = jitter;
        if !(0.0 <= start && start <= end && end < 1.0) {
            return Err(InvalidRetryConfig::Jitter {
                low: start,
                high: end,
            });
        }

        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter_low: start,
            jitter_high: end,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// The range the relative jitter is drawn from.
    pub fn jitter(&self) -> Range<f64> {
        self.jitter_low..self.jitter_high
    }

    /// The number of times an operation is invoked at most.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Named retry policies, as they can be selected in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    /// Do not retry at all.
    #[default]
    None,
    /// [`RetryConfig::DEFAULT`]
    Default,
    /// [`RetryConfig::AGGRESSIVE`]
    Aggressive,
    /// [`RetryConfig::CONSERVATIVE`]
    Conservative,
}

impl RetryPreset {
    pub fn config(self) -> Option<RetryConfig> {
        match self {
            Self::None => None,
            Self::Default => Some(RetryConfig::DEFAULT),
            Self::Aggressive => Some(RetryConfig::AGGRESSIVE),
            Self::Conservative => Some(RetryConfig::CONSERVATIVE),
        }
    }
}

/// Runs `operation` until it succeeds, fails terminally, or runs out of attempts.
///
/// Errors for which [`Retryable::is_retryable`] is `false` are returned right away. Between
/// attempts, the task sleeps for the [`backoff::delay`] of the failed attempt, without blocking
/// the runtime. When the last attempt fails, its error is returned.
pub async fn execute_with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let attempts = config.attempts();

    for attempt in 0..attempts {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::debug!(error = %error, "Operation failed with a terminal error");
            return Err(error);
        }

        if attempt + 1 >= attempts {
            tracing::warn!(attempts, error = %error, "Operation failed, giving up");
            metric!(counter("retry.exhausted") += 1);
            return Err(error);
        }

        let delay = backoff::delay(attempt, config);
        tracing::warn!(
            attempt = attempt + 1,
            attempts,
            error = %error,
            "Operation failed, retrying in {}",
            humantime::format_duration(delay),
        );
        metric!(counter("retry.attempt") += 1);
        tokio::time::sleep(delay).await;
    }

    Err(E::exhausted())
}
