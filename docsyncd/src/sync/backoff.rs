use std::time::Duration;

use rand::Rng;

/// Exponential delay with optional full jitter, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        if self.jitter && exp > base_ms {
            // Never drop below the base pause.
            Duration::from_millis(rng.gen_range(base_ms..=exp))
        } else {
            Duration::from_millis(exp)
        }
    }
}

/// Tracks consecutive transient failures of the upload worker and turns them
/// into the pause before its next poll.
#[derive(Debug)]
pub struct FailurePacer {
    pause: Duration,
    backoff: Backoff,
    streak: u32,
}

impl FailurePacer {
    pub fn new(pause: Duration, max: Duration) -> Self {
        Self {
            pause,
            backoff: Backoff::new(pause.max(Duration::from_millis(1)), max.max(pause), true),
            streak: 0,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn record_success(&mut self) {
        self.streak = 0;
    }

    pub fn record_transient_failure(&mut self) {
        self.streak = self.streak.saturating_add(1);
    }

    pub fn next_pause(&self) -> Duration {
        let mut rng = rand::thread_rng();
        self.next_pause_with_rng(&mut rng)
    }

    pub fn next_pause_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.streak == 0 {
            self.pause
        } else {
            self.backoff.delay_with_rng(self.streak, rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jittered_delay_stays_between_base_and_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn pacer_returns_to_plain_pause_after_success() {
        let mut pacer = FailurePacer::new(Duration::from_millis(1000), Duration::from_secs(60));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pacer.next_pause_with_rng(&mut rng), Duration::from_millis(1000));

        pacer.record_transient_failure();
        pacer.record_transient_failure();
        let slowed = pacer.next_pause_with_rng(&mut rng);
        assert!(slowed >= Duration::from_millis(1000));
        assert!(slowed <= Duration::from_secs(4));
        assert_eq!(pacer.streak(), 2);

        pacer.record_success();
        assert_eq!(pacer.next_pause_with_rng(&mut rng), Duration::from_millis(1000));
    }
}
