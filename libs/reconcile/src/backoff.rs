//! Exponential backoff for reconnect loops.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any delay, jitter included.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(1),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// A policy starting at `base` and never exceeding `max`.
    pub fn capped(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Spread each delay by up to `jitter` of itself in either direction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let unit: f64 = rand::random::<f64>() * 2.0 - 1.0;
            delay * self.jitter * unit
        } else {
            0.0
        };

        let final_delay = (delay + jitter).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::capped(Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = BackoffPolicy::capped(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(0.5);
        for attempt in 0..20 {
            assert!(policy.delay(attempt) <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_jitter_spreads_around_base() {
        let policy = BackoffPolicy::capped(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.2);
        let delays: Vec<_> = (0..200).map(|_| policy.delay(0)).collect();

        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(80) && *d <= Duration::from_millis(120)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let policy = BackoffPolicy::default().with_jitter(3.0);
        assert_eq!(policy.jitter, 1.0);
        let policy = BackoffPolicy::default().with_jitter(-1.0);
        assert_eq!(policy.jitter, 0.0);
        assert_eq!(policy.delay(0), Duration::from_millis(50));
    }
}
