//! Restart decisions
//!
//! Policy arithmetic lives on [`RestartPolicy`]; this module adds the
//! per-service attempt bookkeeping: counting, jitter, the give-up check,
//! and the reset after sustained healthy uptime.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::RestartPolicy;
use crate::identity::ServiceId;

/// Outcome of asking whether a service may restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; this is attempt number `attempt`
    Restart { attempt: u32, delay: Duration },
    /// Policy disabled or attempts exhausted
    GiveUp,
}

/// Per-service restart attempt counters. Owned by the supervisor; not
/// shared.
#[derive(Debug, Default)]
pub struct RestartTracker {
    attempts: HashMap<ServiceId, u32>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether the service may restart. `uptime` is how long the
    /// dying epoch ran; an epoch that outlived the policy's reset window
    /// clears the counter first, so a service that crashes once a week
    /// never exhausts its attempts.
    pub fn decide(
        &mut self,
        id: ServiceId,
        policy: &RestartPolicy,
        uptime: Option<Duration>,
    ) -> RestartDecision {
        let counter = self.attempts.entry(id).or_insert(0);

        if let Some(uptime) = uptime {
            if *counter > 0 && uptime >= policy.reset_window() {
                debug!(
                    "Service {} ran {:?} (>= reset window {:?}), clearing restart attempts",
                    id,
                    uptime,
                    policy.reset_window()
                );
                *counter = 0;
            }
        }

        let attempt = *counter + 1;
        if !policy.allows_attempt(attempt) {
            return RestartDecision::GiveUp;
        }

        *counter = attempt;
        RestartDecision::Restart {
            attempt,
            delay: with_jitter(policy.delay_for_attempt(attempt)),
        }
    }

    /// Current attempt count for a service
    pub fn attempts(&self, id: &ServiceId) -> u32 {
        self.attempts.get(id).copied().unwrap_or(0)
    }

    /// Drop all bookkeeping for a service (stopped or removed)
    pub fn forget(&mut self, id: &ServiceId) {
        self.attempts.remove(id);
    }
}

/// Spread restarts by ±10% so a fleet degraded by one upstream event does
/// not thunder back in lockstep
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
