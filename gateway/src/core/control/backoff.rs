use std::time::{Duration, SystemTime};

use serde::Deserialize;

/// Reconnection schedule for the control session.
///
/// Reconnection never gives up; `alarm_after_attempts` only decides when the
/// outage is escalated to an operator-visible alarm.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Default: 1000ms
    pub initial_delay_ms: u64,
    /// Default: 30000ms
    pub max_delay_ms: u64,
    /// Default: 2.0
    pub backoff_multiplier: f32,
    /// Default: true
    pub jitter: bool,
    /// Default: 5
    pub alarm_after_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
            alarm_after_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // base * multiplier^(attempt-1), capped
        let delay = base * multiplier.powi(attempt.saturating_sub(1).min(32) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        let delay = if self.jitter {
            // Up to 25% either way, never above the cap
            (delay + rand_jitter(delay * 0.25)).clamp(0.0, self.max_delay_ms as f64)
        } else {
            delay
        };
        Duration::from_millis(delay as u64)
    }

    pub fn should_alarm(&self, attempt: u32) -> bool {
        self.alarm_after_attempts > 0 && attempt >= self.alarm_after_attempts
    }
}

/// Pseudo-random jitter in `-range..range` from a simple LCG over the clock.
fn rand_jitter(range: f64) -> f64 {
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}
