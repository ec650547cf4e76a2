//! Domain errors for the claw orchestration core.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Core errors surfaced by the engine, waiter, plan executor, and stores.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Queue saturated for scope {scope}: depth {depth} >= limit {limit}")]
    QueueSaturated { scope: String, depth: u64, limit: u64 },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("Plan execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Lease lost for task {task_id}: owner {lease_owner} is stale")]
    LeaseLost { task_id: Uuid, lease_owner: String },

    #[error("Timed out waiting for task {0}")]
    WaitTimeout(Uuid),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Processor error: {0}")]
    Processor(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

/// Classification tag recorded on a failed attempt.
///
/// Derived by scanning the error message; informs external retry and
/// failover policy but never changes engine behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Auth,
    RateLimit,
    Timeout,
    Billing,
    ContextOverflow,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::Billing => "BILLING",
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AUTH" => Some(Self::Auth),
            "RATE_LIMIT" => Some(Self::RateLimit),
            "TIMEOUT" => Some(Self::Timeout),
            "BILLING" => Some(Self::Billing),
            "CONTEXT_OVERFLOW" => Some(Self::ContextOverflow),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Classify an error message into a code by substring scan.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
            || lower.contains("401")
        {
            Self::Auth
        } else if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
        {
            Self::RateLimit
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            Self::Timeout
        } else if lower.contains("billing") || lower.contains("quota") || lower.contains("credit") {
            Self::Billing
        } else if lower.contains("context")
            && (lower.contains("overflow") || lower.contains("too long") || lower.contains("length"))
        {
            Self::ContextOverflow
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        assert_eq!(ErrorCode::classify("invalid API key provided"), ErrorCode::Auth);
        assert_eq!(ErrorCode::classify("401 Unauthorized"), ErrorCode::Auth);
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(ErrorCode::classify("rate limit exceeded"), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::classify("HTTP 429: too many requests"), ErrorCode::RateLimit);
    }

    #[test]
    fn test_classify_timeout() {
        assert_eq!(ErrorCode::classify("request timed out"), ErrorCode::Timeout);
        assert_eq!(ErrorCode::classify("deadline exceeded"), ErrorCode::Timeout);
    }

    #[test]
    fn test_classify_context_overflow() {
        assert_eq!(ErrorCode::classify("context window overflow"), ErrorCode::ContextOverflow);
        assert_eq!(ErrorCode::classify("prompt context too long"), ErrorCode::ContextOverflow);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(ErrorCode::classify("something strange happened"), ErrorCode::Unknown);
    }

    #[test]
    fn test_code_round_trip() {
        for code in [
            ErrorCode::Auth,
            ErrorCode::RateLimit,
            ErrorCode::Timeout,
            ErrorCode::Billing,
            ErrorCode::ContextOverflow,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::from_str(code.as_str()), Some(code));
        }
    }
}
