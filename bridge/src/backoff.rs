//! Reconnect delays.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential reconnect backoff.
///
/// Starts at `min`, doubles after every failed attempt up to `max`, and drops
/// back to `min` once a session stays READY for at least `stability`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    stability: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, stability: Duration) -> Self {
        Self {
            min,
            max,
            stability,
            current: min,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_min_ms),
            Duration::from_millis(config.backoff_max_ms),
            Duration::from_millis(config.stability_threshold_ms),
        )
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Records the end of a READY session. Returns true if it was long
    /// enough to reset the backoff.
    pub fn session_ended(&mut self, ready_for: Duration) -> bool {
        if ready_for >= self.stability {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Consecutive attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = backoff();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(backoff.attempts(), 9);
    }

    #[test]
    fn test_short_session_keeps_backoff() {
        let mut backoff = backoff();
        backoff.next_delay();
        backoff.next_delay();

        assert!(!backoff.session_ended(Duration::from_secs(29)));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_stable_session_resets() {
        let mut backoff = backoff();
        for _ in 0..5 {
            backoff.next_delay();
        }

        assert!(backoff.session_ended(Duration::from_secs(30)));
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_config_defaults() {
        let mut backoff = Backoff::from_config(&ConnectionConfig::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
