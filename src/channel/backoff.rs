//! Exponential reconnect backoff.

use crate::defaults;
use std::time::Duration;

/// How often and how patiently the channel reconnects after an unintentional close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before the channel gives up.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles for every following one.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            base_delay: defaults::RECONNECT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the `attempt`-th reconnect (1-based): `base * 2^(attempt-1)`.
    ///
    /// Saturates instead of overflowing for absurd attempt counts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
