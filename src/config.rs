//! Reactor configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `max_descriptors` | 16 384 |
//! | `events_per_cycle` | 128 |
//! | `wait_cap` | 5 minutes |

use std::time::Duration;

/// Tunable limits for a [`Reactor`](crate::Reactor).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on concurrently registered descriptors. Allocation
    /// beyond this cap fails with [`Error::Exhausted`](crate::Error).
    pub max_descriptors: usize,
    /// Maximum kernel events retrieved per wait cycle. More remain
    /// queued in the kernel for the next cycle.
    pub events_per_cycle: usize,
    /// Cap on how long one wait cycle may block, even with no timers
    /// registered. Bounds the loop's reaction time to state it cannot
    /// be woken for.
    pub wait_cap: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_descriptors: 16_384,
            events_per_cycle: 128,
            wait_cap: Duration::from_secs(300),
        }
    }
}

impl ReactorConfig {
    /// Clamp configuration values to workable minimums.
    pub fn normalize(&mut self) {
        if self.max_descriptors == 0 {
            self.max_descriptors = 1;
        }
        if self.events_per_cycle == 0 {
            self.events_per_cycle = 1;
        }
        if self.wait_cap == Duration::ZERO {
            self.wait_cap = Duration::from_millis(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ReactorConfig::default();
        assert_eq!(config.events_per_cycle, 128);
        assert_eq!(config.wait_cap, Duration::from_secs(300));
        assert!(config.max_descriptors > 0);
    }

    #[test]
    fn normalize_rejects_zeroes() {
        let mut config = ReactorConfig {
            max_descriptors: 0,
            events_per_cycle: 0,
            wait_cap: Duration::ZERO,
        };
        config.normalize();
        assert_eq!(config.max_descriptors, 1);
        assert_eq!(config.events_per_cycle, 1);
        assert!(config.wait_cap > Duration::ZERO);
    }
}
