//! Session engine configuration.

use std::time::Duration;

/// Exponential backoff schedule for re-joining after a transport drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Attempts before the session is declared Failed
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0-based), or `None` once exhausted.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(
            self.initial_backoff
                .checked_mul(factor)
                .map_or(self.max_backoff, |d| d.min(self.max_backoff)),
        )
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on TCP connect plus TLS and WebSocket setup
    pub connect_timeout: Duration,
    /// Bound on the wait for JoinAccepted / JoinRejected
    pub handshake_timeout: Duration,
    /// Bound on the liveness probe (and re-join) done by resume
    pub resume_timeout: Duration,
    /// Position is resent at least this often even without movement
    pub liveness_interval: Duration,
    /// Autopilot tick
    pub autopilot_tick: Duration,
    pub reconnect: ReconnectPolicy,
    /// Name the relay certificate must carry
    pub tls_server_name: String,
    /// Port used when the endpoint omits one
    pub default_port: u16,
    /// Bounded capacity of the upward event channel
    pub event_capacity: usize,
    /// Worker threads of the session runtime
    pub io_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            resume_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(1),
            autopilot_tick: Duration::from_millis(50),
            reconnect: ReconnectPolicy::default(),
            tls_server_name: "bubbles-server".to_string(),
            default_port: 4444,
            event_capacity: 256,
            io_threads: 2,
        }
    }
}
