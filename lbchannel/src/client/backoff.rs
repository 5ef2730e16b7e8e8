// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Computes how long a subchannel waits before its next connect attempt.
pub trait BackoffPolicy: Send + Sync + 'static {
    /// Delay before retrying after `attempt` consecutive failed rounds, counting from 1.
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ExponentialBackoff {
    /// Delay after the first failure, default is 1s.
    pub(crate) initial: Duration,
    /// Growth factor per attempt, default is 1.6.
    pub(crate) multiplier: f64,
    /// Relative jitter applied in both directions, default is 0.2.
    pub(crate) jitter: f64,
    /// Upper bound before jitter, default is 120s.
    pub(crate) max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max: Duration::from_secs(120),
        }
    }
}

impl ExponentialBackoff {
    /// Set the delay after the first failure.
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }
    /// Set the growth factor, values below 1.0 are raised to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }
    /// Set the relative jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
    /// Set the upper bound.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::{BackoffPolicy, ExponentialBackoff};
    use std::time::Duration;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = ExponentialBackoff::default().with_jitter(0.0).with_max(Duration::from_secs(3));
        assert_eq!(backoff.next_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(2).as_millis(), 1600);
        assert_eq!(backoff.next_delay(3).as_millis(), 2560);
        assert_eq!(backoff.next_delay(50), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = ExponentialBackoff::default();
        for _ in 0..100 {
            let delay = backoff.next_delay(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }
}
