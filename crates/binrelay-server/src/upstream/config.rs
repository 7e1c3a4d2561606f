//! Reconnection policy for the upstream session.

use std::time::Duration;

use binrelay_core::config::ReconnectSettings;

/// Exponential backoff with a hard failure budget.
///
/// Failures are counted from 1. The delay after failure `n` is
/// `base * multiplier^(n-1)` capped at `max_delay`. Once `n` reaches
/// `max_attempts` the policy gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the given consecutive failure (1-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another connection attempt may follow `failures` consecutive failures.
    pub const fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
