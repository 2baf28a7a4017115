//! Reconnection backoff

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential reconnect delay with a ceiling
///
/// `delay(n) = min(base × multiplier^(n−1), max)` for the n-th attempt (1-based).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            // A multiplier below 1 would make delays shrink
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_attempts,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.reconnect_interval(),
            config.max_reconnect_interval(),
            config.backoff_multiplier,
            config.max_reconnect_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
