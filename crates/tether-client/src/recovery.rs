//! Error classification and recovery policy.
//!
//! Backend error codes map through a static table to a [`RecoveryDirective`]
//! telling the session whether to retry, take the fallback route, or just tell
//! the user. [`ErrorContext`] keeps a short rolling log so that the same
//! failure repeating quickly stops being retried automatically.

use crate::config::ErrorContextConfig;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Error codes the backend reports in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AgentUnavailable,
    AgentTimeout,
    InvalidMessage,
    RateLimitExceeded,
    SessionNotFound,
    AuthenticationFailed,
    InternalError,
}

impl ErrorCode {
    /// Map a wire code, including the backend's older spellings. Anything
    /// unrecognised is an internal error.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "AGENT_UNAVAILABLE" | "AGENT_NOT_FOUND" => ErrorCode::AgentUnavailable,
            "AGENT_TIMEOUT" => ErrorCode::AgentTimeout,
            "INVALID_MESSAGE" | "INVALID_MESSAGE_FORMAT" | "VALIDATION_ERROR" | "invalid_json" => {
                ErrorCode::InvalidMessage
            }
            "RATE_LIMIT_EXCEEDED" => ErrorCode::RateLimitExceeded,
            "SESSION_NOT_FOUND" => ErrorCode::SessionNotFound,
            "AUTHENTICATION_FAILED" | "AUTHENTICATION_ERROR" | "AUTHORIZATION_ERROR" => {
                ErrorCode::AuthenticationFailed
            }
            _ => ErrorCode::InternalError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AgentUnavailable => "AGENT_UNAVAILABLE",
            ErrorCode::AgentTimeout => "AGENT_TIMEOUT",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong, as far as the classifier is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSignal {
    Backend(ErrorCode),
    /// A transport fault with no backend code attached.
    Transport(String),
}

/// Key under which failures are counted in the [`ErrorContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Code(ErrorCode),
    Transport,
}

impl FailureSignal {
    pub fn kind(&self) -> FailureKind {
        match self {
            FailureSignal::Backend(code) => FailureKind::Code(*code),
            FailureSignal::Transport(_) => FailureKind::Transport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Send the same message again over the socket.
    Retry,
    /// Send it through the alternative route (REST).
    Fallback,
    /// Do nothing automatically; show the message.
    Notify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDirective {
    pub strategy: RecoveryStrategy,
    pub retryable: bool,
    pub retry_delay: Option<Duration>,
    pub max_retries: Option<u32>,
    pub user_message: String,
}

impl RecoveryDirective {
    fn recover(strategy: RecoveryStrategy, delay_ms: u64, max_retries: u32, msg: &str) -> Self {
        Self {
            strategy,
            retryable: true,
            retry_delay: Some(Duration::from_millis(delay_ms)),
            max_retries: Some(max_retries),
            user_message: msg.to_string(),
        }
    }

    fn notify(msg: &str) -> Self {
        Self {
            strategy: RecoveryStrategy::Notify,
            retryable: false,
            retry_delay: None,
            max_retries: None,
            user_message: msg.to_string(),
        }
    }

    /// What to do when the circuit breaker refuses an attempt.
    pub fn circuit_open() -> Self {
        Self::notify("Too many failures. Please try again later.")
    }

    /// Turn a directive into a notification, keeping its message.
    pub fn into_notify(self) -> Self {
        Self {
            strategy: RecoveryStrategy::Notify,
            retryable: false,
            retry_delay: None,
            max_retries: None,
            user_message: self.user_message,
        }
    }
}

/// Look up the recovery policy for a failure.
pub fn classify(signal: &FailureSignal) -> RecoveryDirective {
    use RecoveryStrategy::{Fallback, Retry};

    match signal {
        FailureSignal::Backend(code) => match code {
            ErrorCode::AgentUnavailable => RecoveryDirective::recover(
                Fallback,
                5_000,
                3,
                "The agent is currently unavailable. Trying another route.",
            ),
            ErrorCode::AgentTimeout => RecoveryDirective::recover(
                Retry,
                2_000,
                2,
                "The agent took too long to respond. Retrying.",
            ),
            ErrorCode::InvalidMessage => RecoveryDirective::notify(
                "This message could not be processed. Please check it and try again.",
            ),
            ErrorCode::RateLimitExceeded => RecoveryDirective::recover(
                Retry,
                10_000,
                1,
                "You are sending messages too quickly. Please wait a moment.",
            ),
            ErrorCode::SessionNotFound => RecoveryDirective::recover(
                Fallback,
                1_000,
                1,
                "The conversation session was not found. Restoring it.",
            ),
            ErrorCode::AuthenticationFailed => {
                RecoveryDirective::notify("Authentication failed. Please sign in again.")
            }
            ErrorCode::InternalError => RecoveryDirective::recover(
                Retry,
                3_000,
                2,
                "The server hit an unexpected error. Retrying.",
            ),
        },
        FailureSignal::Transport(_) => {
            RecoveryDirective::recover(Retry, 1_000, 3, "Connection problem. Retrying.")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub at: Instant,
    pub recovered: bool,
}

/// Bounded rolling log of recent failures.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
}

impl ErrorContext {
    pub fn new(config: &ErrorContextConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, kind: FailureKind) {
        self.record_at(kind, Instant::now());
    }

    pub fn record_at(&mut self, kind: FailureKind, at: Instant) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(ErrorRecord {
            kind,
            at,
            recovered: false,
        });
    }

    /// Flag the most recent unrecovered failure of `kind` as recovered.
    pub fn mark_recovered(&mut self, kind: FailureKind) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.kind == kind && !r.recovered)
        {
            record.recovered = true;
        }
    }

    pub fn is_recurring(&self, kind: FailureKind, count: usize, window: Duration) -> bool {
        self.is_recurring_at(kind, count, window, Instant::now())
    }

    /// True when at least `count` failures of `kind` happened within `window`.
    pub fn is_recurring_at(
        &self,
        kind: FailureKind,
        count: usize,
        window: Duration,
        now: Instant,
    ) -> bool {
        self.records
            .iter()
            .filter(|r| r.kind == kind && now.saturating_duration_since(r.at) <= window)
            .count()
            >= count
    }

    pub fn records(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
