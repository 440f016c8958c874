//! Exponential backoff with jitter for transient step failures.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Maximum jitter added on top of the capped delay, as a fraction of it.
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms.max(config.base_delay_ms),
            jitter: config.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay with jitter, raised to any server-provided retry-after hint.
    pub fn delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let capped = self.base_delay(attempt);
        let jittered = if self.jitter && !capped.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
            capped + capped.mul_f64(extra)
        } else {
            capped
        };
        match retry_after_secs {
            Some(secs) => jittered.max(Duration::from_secs(secs)),
            None => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter,
        })
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let p = policy(false);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
        assert_eq!(p.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let p = policy(true);
        for attempt in 1..=6 {
            let base = p.base_delay(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt, None);
                assert!(d >= base);
                assert!(d <= base + base.mul_f64(JITTER_RATIO));
            }
        }
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let p = policy(false);
        assert_eq!(p.delay(1, Some(3)), Duration::from_secs(3));
        assert_eq!(p.delay(4, Some(0)), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let p = RetryPolicy::new(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: true,
        });
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(p.delay(3, None), Duration::ZERO);
    }
}
