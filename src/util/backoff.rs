use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Stateful exponential backoff with ±50% jitter.
///
/// The first attempt after a reset is immediate; each following attempt grows the base
/// delay by the configured factor, clamped to `[initial_delay, max_delay]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0.0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base_millis;
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = (base + jitter).floor().max(0.0);

        let initial = self.config.initial_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        self.current_base_millis = (base * self.config.backoff_factor).clamp(initial, max);

        Duration::from_millis(delay as u64)
    }

    /// Resets the backoff so the next attempt happens immediately.
    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Jumps straight to the maximum delay, used when the backend reports exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay.as_millis() as f64;
    }

    pub fn current_base(&self) -> Duration {
        Duration::from_millis(self.current_base_millis as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn grows_by_factor_within_jitter() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        backoff.next_delay_with_rng(&mut rng);
        backoff.next_delay_with_rng(&mut rng);
        assert_eq!(backoff.current_base(), Duration::from_millis(1_500));

        let delay = backoff.next_delay_with_rng(&mut rng).as_millis();
        assert!((750..=2_250).contains(&delay), "delay {delay} outside jitter range");
    }

    #[test]
    fn clamps_to_max_and_resets() {
        let mut backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..40 {
            let delay = backoff.next_delay_with_rng(&mut rng);
            assert!(delay <= DEFAULT_MAX_DELAY.mul_f64(1.5));
        }
        assert_eq!(backoff.current_base(), DEFAULT_MAX_DELAY);

        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }

    #[test]
    fn reset_to_max_skips_growth() {
        let mut backoff = ExponentialBackoff::default();
        backoff.reset_to_max();
        let mut rng = StdRng::seed_from_u64(3);
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= DEFAULT_MAX_DELAY / 2);
    }
}
