//! Error-window backoff shared by log stream workers and the event watcher.
//!
//! Every reconnecting loop keeps its own [`ErrorWindow`]. On each failure the
//! loop asks the policy what to do:
//! - errors older than the window are forgotten before counting the new one
//! - more than `max_errors` inside the window means give up
//! - otherwise wait `unit * count`, scaled by a random jitter factor so that
//!   many streams failing at once (engine restart) do not reconnect in lockstep

use std::time::{Duration, Instant};

use rand::Rng;

/// Rolling error state owned by a single reconnecting loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorWindow {
    /// Errors counted in the current window.
    pub count: u32,

    /// When the last error was recorded.
    pub last_error: Instant,
}

impl ErrorWindow {
    /// A fresh window starting at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            last_error: now,
        }
    }
}

/// Outcome of evaluating one more error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Sleep this long, then reconnect.
    Retry(Duration),

    /// Too many errors; stop the loop and check the engine.
    GiveUp,
}

impl BackoffDecision {
    /// Whether the caller has to stop its loop.
    pub fn should_stop(&self) -> bool {
        matches!(self, BackoffDecision::GiveUp)
    }
}

/// Multiplier range applied to every retry delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub min: f64,
    pub max: f64,
}

impl Jitter {
    /// No randomness: always `factor`.
    pub fn fixed(factor: f64) -> Self {
        Self {
            min: factor,
            max: factor,
        }
    }

    fn sample(&self) -> f64 {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self { min: 0.9, max: 1.2 }
    }
}

/// Backoff policy configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Errors older than this are forgotten.
    pub window: Duration,

    /// Give up once the count exceeds this.
    pub max_errors: u32,

    /// Delay per counted error before jitter.
    pub unit: Duration,

    /// Jitter factor range.
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_errors: 5,
            unit: Duration::from_secs(1),
            jitter: Jitter::default(),
        }
    }
}

impl BackoffPolicy {
    /// Record one error at `now` and decide what the caller does next.
    pub fn evaluate(&self, errors: &mut ErrorWindow, now: Instant) -> BackoffDecision {
        if now.saturating_duration_since(errors.last_error) > self.window {
            errors.count = 0;
        }
        errors.count += 1;
        errors.last_error = now;

        if errors.count > self.max_errors {
            return BackoffDecision::GiveUp;
        }

        BackoffDecision::Retry(self.delay(errors.count))
    }

    /// Delay before reconnect attempt number `count`.
    pub fn delay(&self, count: u32) -> Duration {
        self.unit.mul_f64(self.jitter.sample() * f64::from(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_policy_default() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.max_errors, 5);
        assert_eq!(policy.jitter, Jitter { min: 0.9, max: 1.2 });
    }

    #[test]
    fn test_sixth_error_in_window_gives_up() {
        let policy = BackoffPolicy {
            jitter: Jitter::fixed(1.0),
            ..Default::default()
        };
        let start = Instant::now();
        let mut errors = ErrorWindow::new(start);

        // Six errors spread over ten seconds.
        let decisions: Vec<_> = (0..6u64)
            .map(|i| policy.evaluate(&mut errors, start + Duration::from_secs(i * 2)))
            .collect();

        assert!(decisions[..5].iter().all(|d| !d.should_stop()));
        assert_eq!(decisions[5], BackoffDecision::GiveUp);
        assert_eq!(errors.count, 6);
    }

    #[test]
    fn test_errors_outside_window_reset_count() {
        let policy = BackoffPolicy {
            jitter: Jitter::fixed(1.0),
            ..Default::default()
        };
        let start = Instant::now();
        let mut errors = ErrorWindow::new(start);

        for i in 1..=5u64 {
            let decision = policy.evaluate(&mut errors, start + Duration::from_secs(i * 70));
            assert!(!decision.should_stop());
            assert_eq!(errors.count, 1);
        }
    }

    #[test]
    fn test_delay_is_proportional_to_count() {
        let policy = BackoffPolicy {
            jitter: Jitter::fixed(1.0),
            ..Default::default()
        };
        let start = Instant::now();
        let mut errors = ErrorWindow::new(start);

        assert_eq!(
            policy.evaluate(&mut errors, start),
            BackoffDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            policy.evaluate(&mut errors, start + Duration::from_secs(1)),
            BackoffDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.evaluate(&mut errors, start + Duration::from_secs(2)),
            BackoffDecision::Retry(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_jittered_delay_stays_in_range() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(3);
            assert!(delay >= Duration::from_millis(2700));
            assert!(delay <= Duration::from_millis(3600));
        }
    }
}
