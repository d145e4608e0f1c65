//! Retry backoff and request pacing.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt; `max_attempts = max_retries + 1`.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            max_retries: max_attempts.saturating_sub(1),
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Exponential ceiling for the retry following `attempt_index` (0-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(attempt_index.min(31) as u32)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full jitter: uniform in `[0, delay_for_attempt]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt_index: usize, rng: &mut R) -> Duration {
        let ceiling = self.delay_for_attempt(attempt_index).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One token every `1 / rps` seconds, no burst. `None` when unthrottled.
    pub fn per_second(requests_per_second: f64) -> Option<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: 1,
            refill_every: Duration::from_secs_f64(1.0 / requests_per_second),
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if self.refill_every.is_zero() {
                return;
            }
            let elapsed = now.duration_since(state.last_refill);
            let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
            if refills > 0 {
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next_token_at = state.last_refill + self.refill_every;
            drop(state);
            tokio::time::sleep_until(next_token_at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn jitter_stays_under_the_ceiling() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            let delay = policy.jittered_delay(attempt, &mut rng);
            assert!(delay <= policy.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn zero_rate_means_unthrottled() {
        assert_eq!(TokenBucketConfig::per_second(0.0), None);
        let config = TokenBucketConfig::per_second(4.0).unwrap();
        assert_eq!(config.refill_every, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_requests() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig::per_second(2.0).unwrap());
        let start = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        // first token is immediate, the next two wait 500ms each
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }
}
