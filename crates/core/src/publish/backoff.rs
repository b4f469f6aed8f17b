use std::time::Duration;

use rand::Rng;

use crate::config::{BrokerConfig, MAX_RECONNECT_SECS};

/// Binary-exponential reconnect delay with symmetric jitter.
///
/// Attempt `n` (1-based) waits `min(base * 2^(n-1), max)`, then scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`. A successful connection resets
/// the attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delays outside `0..=MAX_RECONNECT_SECS` are clamped; validated
    /// configs never contain them.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            seconds(config.reconnect_base_secs),
            seconds(config.reconnect_max_secs),
            config.reconnect_jitter,
        )
    }

    /// Consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay before retry number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base.saturating_mul(multiplier);
        std::cmp::min(delay, self.max)
    }

    /// Records one more failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    /// [`next_delay`](Self::next_delay) with a caller-supplied jitter source.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.delay_for_attempt(self.attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rng.random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn seconds(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_RECONNECT_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }

    #[test]
    fn nth_retry_doubles_up_to_the_cap() {
        let mut backoff = standard();
        for n in 1..=10u32 {
            let delay = backoff.next_delay().as_secs_f64();
            let expected = 2f64.powi(n as i32 - 1).min(60.0);
            assert!(
                (delay - expected).abs() <= expected * 0.1 + 1e-9,
                "retry {n}: {delay} not within jitter of {expected}"
            );
            assert_eq!(backoff.attempt(), n);
        }
    }

    #[test]
    fn unjittered_schedule() {
        let backoff = standard();
        let delays: Vec<u64> = (0..=8)
            .map(|n| backoff.delay_for_attempt(n).as_secs())
            .collect();

        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn success_resets_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(32));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn built_from_broker_config() {
        let backoff = Backoff::from_config(&BrokerConfig::default());
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn out_of_range_config_delays_are_clamped() {
        let config = BrokerConfig {
            reconnect_max_secs: 1e30,
            ..BrokerConfig::default()
        };
        let backoff = Backoff::from_config(&config);
        assert_eq!(
            backoff.delay_for_attempt(40),
            Duration::from_secs_f64(MAX_RECONNECT_SECS)
        );
    }
}
