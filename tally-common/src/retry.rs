use std::time::Duration;

use rand::Rng;

/// Parameters of an exponential backoff schedule.
///
/// The schedule is stateless so that a delay can be recomputed from a failure
/// count that was persisted by a previous process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryParams {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Factor applied for every further failure.
    pub multiplier: f64,
    /// Relative randomization applied to the computed delay, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// A retry interval generator that increases timeouts with exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryBackoff {
    params: RetryParams,
}

impl RetryBackoff {
    /// Creates a new retry backoff based on configured thresholds.
    pub fn new(params: RetryParams) -> Self {
        Self { params }
    }

    /// Returns the delay to wait after the given number of consecutive failures.
    ///
    /// `failure_count` is 1-based: the delay after the first failure is the base
    /// delay. The exponential curve is clamped to `max_delay` before jitter is
    /// applied, so a single delay never exceeds `max_delay * (1 + jitter)`.
    pub fn delay(&self, failure_count: u32) -> Duration {
        let delay = self.exact_delay(failure_count);
        let jitter = self.params.jitter.clamp(0.0, 0.999);
        if jitter == 0.0 {
            return delay;
        }

        let factor = rand::thread_rng().gen_range(1.0 - jitter..1.0 + jitter);
        delay.mul_f64(factor)
    }

    /// Returns the delay without jitter applied.
    pub fn exact_delay(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(63);
        let factor = self.params.multiplier.max(1.0).powi(exponent as i32);
        let delay = self.params.base_delay.mul_f64(factor);
        delay.clamp(self.params.base_delay, self.params.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RetryBackoff {
        RetryBackoff::new(RetryParams {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        })
    }

    #[test]
    fn test_exponential_curve() {
        let backoff = backoff();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(6), Duration::from_secs(32));
        // 2^6 = 64s exceeds the 60s cap.
        assert_eq!(backoff.delay(7), Duration::from_secs(60));
    }

    #[test]
    fn test_max_delay_clamps() {
        let backoff = backoff();
        assert_eq!(backoff.delay(32), Duration::from_secs(60));
        // Large failure counts must not overflow the exponent.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = RetryBackoff::new(RetryParams {
            jitter: 0.2,
            ..RetryParams::default()
        });

        for _ in 0..100 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }
}
