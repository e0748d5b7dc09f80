use chrono::Duration;
use rand::Rng;

/// Default backoff policy per the outer spec's §4.3:
/// `delay = min(cap, base * 2^(attempt-1)) + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::milliseconds(500),
            cap: Duration::seconds(120),
            jitter: Duration::milliseconds(250),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` is 1-based (first retry after the first failure).
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base.num_milliseconds();
        let cap_ms = self.cap.num_milliseconds();
        let exp = base_ms.saturating_mul(1i64 << attempt.min(32).saturating_sub(1));
        let bounded = exp.min(cap_ms).max(0);

        let jitter_ms = self.jitter.num_milliseconds().max(0);
        let jitter_sample = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };

        Duration::milliseconds(bounded + jitter_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::zero();
        for attempt in 1..=12 {
            // Subtract the max jitter so the comparison is stable regardless
            // of the random jitter sample drawn for each attempt.
            let delay = policy.delay_for(attempt) - policy.jitter;
            assert!(delay >= prev, "attempt {attempt} regressed backoff");
            prev = delay;
        }
        assert!(prev <= policy.cap);
    }

    #[test]
    fn backoff_never_negative() {
        let policy = BackoffPolicy::default();
        for attempt in -5..1 {
            assert!(policy.delay_for(attempt) >= Duration::zero());
        }
    }
}
