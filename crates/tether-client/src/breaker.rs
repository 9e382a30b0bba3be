//! Circuit breaker.
//!
//! Pure state: callers ask [`CircuitBreaker::can_attempt`] before an operation
//! and report the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`]. The `_at` variants take the current
//! instant explicitly.

use crate::config::BreakerConfig;
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    pub fn can_attempt(&mut self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    /// Whether an operation may proceed now. Once the reset timeout has passed
    /// an open breaker goes half-open and lets exactly one trial through.
    pub fn can_attempt_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) > self.config.reset_timeout());
                if cooled {
                    tracing::info!(breaker = %self.name, "circuit half-open, allowing one trial");
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "trial failed, circuit reopened");
                self.state = CircuitState::Open;
            }
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = self.failure_count,
                    "circuit opened"
                );
                self.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Back to closed with a clean slate.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
        self.trial_in_flight = false;
    }
}
