//! Reconnect backoff with exponential delay, cap, and jitter.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Fraction of the capped delay used as the jitter window.
const JITTER_FRACTION: f64 = 0.3;

/// Computes reconnect delays and decides when to give up.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// The base delay grows exponentially and is capped, then uniform
    /// jitter in `[0, 0.3 * delay)` is added to spread reconnect storms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_ms(attempt);

        // Deterministic hash over wall clock and attempt stands in for an
        // RNG; the spread matters, not the quality.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0) as u64;
        let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
        let fraction = (hash % 1000) as f64 / 1000.0;
        let jitter = (capped as f64 * JITTER_FRACTION * fraction) as u64;

        Duration::from_millis(capped + jitter)
    }

    /// Capped exponential delay without jitter, in milliseconds.
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64);
        capped.max(0.0) as u64
    }

    /// Whether attempt `attempt` may run. Zero retries means unbounded.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.config.max_retries == 0 || attempt <= self.config.max_retries
    }

    /// Configured attempt budget.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig::default())
    }

    #[test]
    fn test_first_delay_is_initial_plus_jitter() {
        let delay = policy().delay_for_attempt(1).as_millis() as u64;
        assert!((1_000..1_300).contains(&delay), "delay was {}", delay);
    }

    #[test]
    fn test_delays_grow_exponentially() {
        let p = policy();
        assert_eq!(p.base_delay_ms(1), 1_000);
        assert_eq!(p.base_delay_ms(2), 2_000);
        assert_eq!(p.base_delay_ms(3), 4_000);
        assert_eq!(p.base_delay_ms(5), 16_000);
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(p.base_delay_ms(10), 30_000);
        assert_eq!(p.base_delay_ms(60), 30_000);
        // Jitter stays within 30% of the cap.
        let jittered = p.delay_for_attempt(60).as_millis() as u64;
        assert!((30_000..39_000).contains(&jittered), "delay was {}", jittered);
    }

    #[test]
    fn test_attempt_budget() {
        let p = policy();
        assert!(p.allows_attempt(1));
        assert!(p.allows_attempt(10));
        assert!(!p.allows_attempt(11));

        let unbounded = ReconnectPolicy::new(ReconnectConfig {
            max_retries: 0,
            ..ReconnectConfig::default()
        });
        assert!(unbounded.allows_attempt(1_000_000));
    }
}
