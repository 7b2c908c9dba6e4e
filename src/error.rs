//! Error taxonomy for the relay pipeline.
//!
//! Failures are split into retryable conditions (network hiccups, rate
//! limits) and fatal ones (bad credentials, rejected content). The retry
//! utility consults [`RelayError::is_retryable`] to decide whether another
//! attempt is worthwhile.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Timeout, connection reset, or other transient network failure.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// The destination asked us to slow down. Carries the retry-after
    /// hint when the platform provided one.
    #[error("rate limited by destination")]
    RateLimited { retry_after: Option<Duration> },

    /// The session credential is expired or revoked. Never retried; the
    /// owning session is marked invalid.
    #[error("credential invalid for session {session}")]
    CredentialInvalid { session: String },

    /// The destination permanently rejected the content. Never retried.
    #[error("rejected by destination: {0}")]
    Rejected(String),

    /// All retry attempts were exhausted for an outbound call.
    #[error("delivery failed after {attempts} attempts: {last}")]
    DeliveryFailed { attempts: u32, last: String },

    /// An edit or delete arrived for a message that was never delivered.
    /// The event is dropped, not treated as a new creation.
    #[error("no mapping for pair {pair} message {message_id}")]
    MappingNotFound { pair: String, message_id: i64 },

    /// Configuration failed validation at load or reload time. The
    /// previously valid snapshot stays active.
    #[error("config validation failed: {0}")]
    ConfigValidation(String),

    /// Filesystem failure persisting mappings or pause state.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the retry utility should attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::TransientNetwork(_) | RelayError::RateLimited { .. }
        )
    }

    /// Retry-after hint from a rate-limit response, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RelayError::TransientNetwork("timeout".into()).is_retryable());
        assert!(RelayError::RateLimited { retry_after: None }.is_retryable());
        assert!(!RelayError::CredentialInvalid {
            session: "s1".into()
        }
        .is_retryable());
        assert!(!RelayError::Rejected("bad markup".into()).is_retryable());
        assert!(!RelayError::MappingNotFound {
            pair: "p1".into(),
            message_id: 7
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = RelayError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(
            RelayError::TransientNetwork("x".into()).retry_after(),
            None
        );
    }
}
