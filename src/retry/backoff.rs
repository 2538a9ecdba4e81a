use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Trait defining backoff behavior
pub trait Backoff: Send + Sync {
    /// Delay to wait before the given attempt (0-based)
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Reset any internal state
    fn reset(&mut self);
}

/// Capped exponential backoff with optional jitter.
///
/// The delay for attempt `n` is `initial_delay * multiplier^n`, capped at
/// `max_delay`. Jitter is applied after capping and the result is clamped to
/// `[initial_delay, max_delay]`, so a backoff never waits less than its
/// initial delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Create a new builder for ExponentialBackoff
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let floor = self.initial_delay.as_millis() as f64;
        let ceiling = self.max_delay.as_millis() as f64;

        let exp_delay = floor * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = exp_delay.min(ceiling);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).clamp(floor, ceiling);

        trace!(
            attempt = attempt,
            base_delay_ms = capped_delay,
            jitter_ms = jitter,
            final_delay_ms = final_delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(final_delay as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }

    fn reset(&mut self) {}
}

/// Builder for ExponentialBackoff
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay.max(self.initial_delay),
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exponential_backoff_calculation() {
        let max_delay = Duration::from_secs(10);
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(max_delay)
            .multiplier(2.0)
            .jitter_factor(0.0)
            .build();

        let delays: Vec<Duration> = (0..5).map(|attempt| backoff.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[4], Duration::from_millis(1600));

        let max_attempt_delay = backoff.next_delay(40);
        assert_eq!(max_attempt_delay, max_delay);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter_factor(0.5)
            .build();

        let delays: Vec<Duration> = (0..100).map(|_| backoff.next_delay(1)).collect();

        let unique_delays: std::collections::HashSet<_> = delays.iter().collect();
        assert!(unique_delays.len() > 1);

        for delay in delays {
            let ms = delay.as_millis() as f64;
            assert!(ms >= 100.0, "jitter went below the floor: {}ms", ms);
            assert!(ms <= 300.0);
        }
    }

    #[test]
    fn test_never_below_initial_delay() {
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(400))
            .jitter_factor(1.0)
            .build();

        for _ in 0..200 {
            assert!(backoff.next_delay(0) >= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_builder_constraints() {
        let backoff = ExponentialBackoff::builder().jitter_factor(1.5).build();
        assert!(backoff.jitter_factor <= 1.0);

        let backoff = ExponentialBackoff::builder().jitter_factor(-0.5).build();
        assert!(backoff.jitter_factor >= 0.0);

        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build();
        assert_eq!(backoff.max_delay(), Duration::from_secs(2));
    }
}
