//! Restart policy configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration::{deserialize_duration, serialize_duration};

/// Bounded exponential backoff policy for restarting a degraded forward.
///
/// Delay at attempt n is `min(initial_delay * multiplier^(n-1), max_delay)`.
/// `max_attempts == 0` means unbounded retries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RestartPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_initial_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub initial_delay: Duration,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RestartPolicy {
    /// Backoff delay for the given 1-based attempt number, without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay = self.initial_delay.as_secs_f64() * factor;
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether the given 1-based attempt number is still allowed
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// How long a service must stay running before its attempt counter resets
    pub fn reset_window(&self) -> Duration {
        self.initial_delay.saturating_mul(10)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("restart_policy.initial_delay must be positive".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("restart_policy.max_delay must be >= initial_delay".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("restart_policy.backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
