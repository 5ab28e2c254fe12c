//! Reconnect backoff.

use std::time::Duration;

/// Upper bound on any single reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `min(base * 1.5^(attempt - 1), 60s)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let ms = base.as_millis() as f64 * 1.5f64.powi(exponent);
    let capped = ms.min(MAX_RECONNECT_DELAY.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// How many times, and how fast, to retry a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay for the next attempt given how many were already scheduled,
    /// or `None` once attempts are exhausted.
    pub fn next_delay(&self, scheduled: u32) -> Option<Duration> {
        if scheduled >= self.max_attempts {
            return None;
        }
        Some(reconnect_delay(self.base, scheduled + 1))
    }

    /// The full delay sequence this policy produces.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut scheduled = 0;
        std::iter::from_fn(move || {
            let delay = self.next_delay(scheduled)?;
            scheduled += 1;
            Some(delay)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_interval() {
        assert_eq!(
            reconnect_delay(Duration::from_millis(5000), 1),
            Duration::from_millis(5000)
        );
        assert_eq!(
            reconnect_delay(Duration::from_millis(5000), 2),
            Duration::from_millis(7500)
        );
        assert_eq!(
            reconnect_delay(Duration::from_millis(5000), 4),
            Duration::from_millis(16875)
        );
    }

    #[test]
    fn delays_cap_at_sixty_seconds() {
        assert_eq!(
            reconnect_delay(Duration::from_millis(5000), 10),
            MAX_RECONNECT_DELAY
        );
        assert_eq!(
            reconnect_delay(Duration::from_millis(5000), u32::MAX),
            MAX_RECONNECT_DELAY
        );
    }

    #[test]
    fn policy_sequence_is_non_decreasing_and_bounded() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1000), 5);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= MAX_RECONNECT_DELAY));
        assert_eq!(policy.next_delay(5), None);
    }

    #[test]
    fn long_sequences_flatten_at_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(5000), 20);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.last(), Some(&MAX_RECONNECT_DELAY));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
