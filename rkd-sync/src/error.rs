//! Error types for rkd-sync
//!
//! Taxonomy:
//! - `NetworkFailure`: transport-level (connection refused/reset, truncated stream)
//! - `ProtocolViolation`: malformed or out-of-order stream message
//! - `UpstreamError`: explicit error message from the server
//! - `Cancelled`: expected outcome of supersession, never shown to the user

use thiserror::Error;

/// Sync engine error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Local durable store failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// String shown to the user for a terminated session
    ///
    /// Protocol violations are defects, so the user only sees a generic
    /// message; the detail goes to the log.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::NetworkFailure(_) => {
                "Could not reach the statistics service. Please try again.".to_string()
            }
            SyncError::UpstreamError(reason) => reason.clone(),
            SyncError::ProtocolViolation(_) | SyncError::Storage(_) => {
                "Something went wrong while loading statistics.".to_string()
            }
            SyncError::Cancelled => String::new(),
        }
    }
}

impl From<rkd_common::Error> for SyncError {
    fn from(err: rkd_common::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::ProtocolViolation(err.to_string())
        } else {
            SyncError::NetworkFailure(err.to_string())
        }
    }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_protocol_detail() {
        let err = SyncError::ProtocolViolation("completion without identity".to_string());
        assert!(!err.user_message().contains("identity"));
    }

    #[test]
    fn test_upstream_reason_is_surfaced() {
        let err = SyncError::UpstreamError("Player has no rapid games".to_string());
        assert_eq!(err.user_message(), "Player has no rapid games");
    }

    #[test]
    fn test_cancelled_has_no_user_message() {
        assert!(SyncError::Cancelled.user_message().is_empty());
        assert!(SyncError::Cancelled.is_cancelled());
    }
}
