use rand::Rng;
use std::time::Duration;

/// Exponential retry delay with additive jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 && capped_delay > 0 {
            rand::thread_rng().gen_range(0..=capped_delay * self.jitter_percent / 100)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }

    /// Like [`delay`](Self::delay) but a server-supplied `Retry-After` wins when
    /// it asks for longer, up to the ceiling.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match retry_after {
            Some(hint) => hint.min(Duration::from_millis(self.max_ms)).max(computed),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(100, 10000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(0);
        assert_eq!(backoff.delay(10).as_millis(), 1000);
        assert_eq!(backoff.delay(u32::MAX).as_millis(), 1000);
    }

    #[test]
    fn test_jitter_bounded() {
        let backoff = ExponentialBackoff::new(1000, 1000).with_jitter(10);
        for _ in 0..50 {
            let ms = backoff.delay(0).as_millis();
            assert!((1000..=1100).contains(&ms));
        }
    }

    #[test]
    fn test_retry_after_hint() {
        let backoff = ExponentialBackoff::new(100, 5000).with_jitter(0);
        assert_eq!(
            backoff.delay_with_hint(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.delay_with_hint(0, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
        assert_eq!(
            backoff.delay_with_hint(3, Some(Duration::from_millis(10))),
            Duration::from_millis(800)
        );
    }
}
