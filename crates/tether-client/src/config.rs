//! Tunables for every component.
//!
//! All sections deserialize with defaults, so a config file only needs the
//! keys it changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub ledger: LedgerConfig,
    pub errors: ErrorContextConfig,
}

/// Reconnect and heartbeat policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Extra silence tolerated after a heartbeat before the socket is declared dead.
    /// `None` disables the check.
    pub pong_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt `attempt` (1-indexed):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retry_count: 3,
            retry_delay_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// The ledger is pruned to this many messages after each insert.
    pub max_messages: usize,
    /// Cached history older than this is ignored on load.
    pub cache_ttl_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_messages: 500,
            cache_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl LedgerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContextConfig {
    /// Size of the rolling error log.
    pub capacity: usize,
    /// This many occurrences of one code inside the window stops automatic retries.
    pub recurring_count: usize,
    pub recurring_window_ms: u64,
}

impl Default for ErrorContextConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            recurring_count: 3,
            recurring_window_ms: 60_000,
        }
    }
}

impl ErrorContextConfig {
    pub fn recurring_window(&self) -> Duration {
        Duration::from_millis(self.recurring_window_ms)
    }
}
