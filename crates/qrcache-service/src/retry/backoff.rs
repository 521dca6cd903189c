//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use super::RetryConfig;

/// The delay before the attempt following `attempt`, without jitter.
///
/// This is `base_delay * backoff_multiplier ^ attempt`, capped at `max_delay`. It never
/// decreases with growing `attempt`.
pub fn capped_delay(attempt: u32, config: &RetryConfig) -> Duration {
    if config.base_delay().is_zero() {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let exponential = config.base_delay().as_secs_f64() * config.backoff_multiplier().powi(exponent);
    let max = config.max_delay();

    if exponential >= max.as_secs_f64() {
        return max;
    }
    // rounding must not push the delay below the base
    Duration::try_from_secs_f64(exponential)
        .map_or(max, |delay| delay.clamp(config.base_delay(), max))
}

/// The delay before the attempt following `attempt`, drawing jitter from `rng`.
///
/// The capped delay is stretched by a factor of `1 + jitter`, with `jitter` uniformly drawn from
/// [`RetryConfig::jitter`]. The result lies within `base_delay ..= max_delay * (1 + high)`.
pub fn delay_with_rng<R: Rng>(attempt: u32, config: &RetryConfig, rng: &mut R) -> Duration {
    let capped = capped_delay(attempt, config);

    let range = config.jitter();
    let jitter = if range.is_empty() {
        range.start
    } else {
        rng.gen_range(range)
    };

    Duration::try_from_secs_f64(capped.as_secs_f64() * (1.0 + jitter))
        .map_or(capped, |delay| delay.max(capped))
}

/// The delay before the attempt following `attempt`, using the thread-local random generator.
pub fn delay(attempt: u32, config: &RetryConfig) -> Duration {
    delay_with_rng(attempt, config, &mut rand::thread_rng())
}
