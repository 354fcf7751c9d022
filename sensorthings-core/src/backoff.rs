use rand::Rng;
use std::time::Duration;

/// Delay schedule for retrying transient request failures. Attempt `n`
/// waits `base * 2^n` clamped to `cap`; with jitter enabled the wait is
/// drawn uniformly between zero and that ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            base_ms: whole_millis(base),
            cap_ms: whole_millis(cap),
            jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ceiling = self.base_ms.saturating_mul(factor).min(self.cap_ms);
        let wait_ms = if self.jitter {
            rng.gen_range(0..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(wait_ms)
    }
}

fn whole_millis(value: Duration) -> u64 {
    value.as_millis().min(u128::from(u64::MAX)) as u64
}

/// How many times a transient request failure is attempted before it is
/// surfaced, and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn fixed(base_ms: u64, cap_ms: u64) -> Backoff {
        Backoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            false,
        )
    }

    #[test]
    fn delays_double_then_hold_at_the_cap() {
        let backoff = fixed(250, 1500);
        let mut rng = StdRng::seed_from_u64(3);
        let waits: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(waits, vec![250, 500, 1000, 1500, 1500]);
    }

    #[test]
    fn huge_attempt_counts_saturate_instead_of_wrapping() {
        let backoff = fixed(250, 60_000);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            backoff.delay_with_rng(u32::MAX, &mut rng),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn jittered_delay_never_exceeds_the_ceiling() {
        let backoff = Backoff::new(
            Duration::from_millis(250),
            Duration::from_millis(1500),
            true,
        );
        let mut rng = StdRng::seed_from_u64(11);
        for attempt in 0..10 {
            assert!(backoff.delay_with_rng(attempt, &mut rng) <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn retry_policy_defaults_to_five_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts, 5);
    }
}
