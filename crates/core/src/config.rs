//! Session tuning knobs.

use std::time::Duration;

/// Tuning for one attach session.
///
/// The reconnect policy constants live in [`crate::reconnect`] and are not
/// configurable; these are the caller-supplied budgets.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Overall budget of the pod readiness wait, per attach attempt.
    pub pod_ready_timeout: Duration,
    /// Interval between keep-alive calls to the terminal resource owner.
    pub heartbeat_interval: Duration,
    /// Interval between empty stdin frames keeping the attach socket warm.
    pub keep_alive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pod_ready_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(30),
        }
    }
}
