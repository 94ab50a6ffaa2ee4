//! Error taxonomy for the wagering engine.
//!
//! Every public engine operation returns `Result<T, WagerError>`. Validation
//! and state errors are raised before any write commits, so a failed call
//! never leaves a partial mutation behind.

use std::time::Duration;
use thiserror::Error;

use crate::types::{EventId, EventStatus};

/// Failure reported by the external chat channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The platform asked us to slow down.
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Any other send/edit failure.
    #[error("channel request failed: {0}")]
    Failed(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl ChannelError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ChannelError::RateLimited { .. })
    }
}

/// Coarse classification used when reporting errors to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    StateConflict,
    LimitExceeded,
    AlreadyFinalized,
    PermissionDenied,
    ExternalChannel,
    QueueCleared,
    Internal,
}

#[derive(Debug, Error)]
pub enum WagerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Malformed input: amount, choice, name, etc.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid date/time: {0}")]
    InvalidTime(String),

    /// Operation is not valid for the current status.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("event {0} is locked")]
    EventLocked(EventId),

    #[error("event {id} is not open for betting (status: {status})")]
    EventNotOpen { id: EventId, status: EventStatus },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Idempotent short-circuit; the event was settled earlier.
    #[error("event {0} is already finalized")]
    AlreadyFinalized(EventId),

    #[error("{actor} lacks capability {capability}")]
    PermissionDenied { actor: String, capability: String },

    #[error("external channel error: {0}")]
    ExternalChannel(#[from] ChannelError),

    #[error("operation queue was cleared")]
    QueueCleared,

    /// Arithmetic or integrity failure during settlement.
    #[error("computation error: {0}")]
    Computation(String),

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WagerError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        WagerError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WagerError::NotFound { .. } => ErrorKind::NotFound,
            WagerError::Validation(_) | WagerError::InvalidTime(_) => ErrorKind::Validation,
            WagerError::StateConflict(_)
            | WagerError::EventLocked(_)
            | WagerError::EventNotOpen { .. } => ErrorKind::StateConflict,
            WagerError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            WagerError::AlreadyFinalized(_) => ErrorKind::AlreadyFinalized,
            WagerError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            WagerError::ExternalChannel(_) => ErrorKind::ExternalChannel,
            WagerError::QueueCleared => ErrorKind::QueueCleared,
            WagerError::Computation(_)
            | WagerError::Storage(_)
            | WagerError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Reason shown to the actor who triggered the failing operation.
    /// Internal failures are not echoed verbatim.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "Something went wrong on our side. Nothing was changed; please try again.".into(),
            ErrorKind::PermissionDenied => "You don't have permission to do that.".into(),
            ErrorKind::AlreadyFinalized => "This event has already been settled.".into(),
            ErrorKind::QueueCleared => "The service is shutting down; please try again shortly.".into(),
            _ => {
                let text = self.to_string();
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => text,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(WagerError::EventLocked(1).kind(), ErrorKind::StateConflict);
        assert_eq!(
            WagerError::EventNotOpen { id: 1, status: EventStatus::Paused }.kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(WagerError::InvalidTime("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(WagerError::Computation("x".into()).kind(), ErrorKind::Internal);
        assert_eq!(
            WagerError::from(ChannelError::RateLimited { retry_after: None }).kind(),
            ErrorKind::ExternalChannel
        );
    }

    #[test]
    fn test_user_message_hides_internal_detail() {
        let msg = WagerError::Computation("division by zero".into()).user_message();
        assert!(!msg.contains("division"));

        let msg = WagerError::LimitExceeded("at most 3 active bets".into()).user_message();
        assert_eq!(msg, "Limit exceeded: at most 3 active bets");
    }

    #[test]
    fn test_rate_limit_display() {
        let e = ChannelError::RateLimited { retry_after: Some(Duration::from_millis(1500)) };
        assert_eq!(e.to_string(), "rate limited (retry after 1500ms)");
        assert!(e.is_rate_limit());
        assert!(!ChannelError::Failed("boom".into()).is_rate_limit());
    }
}
