use chrono::{DateTime, Utc};
use thiserror::Error;

/// Unified error type for lattice operations
#[derive(Debug, Error)]
pub enum LatticeError {
    // Remote service errors
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("not permitted: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict on page '{page_id}': server version updated at {server_updated_at}")]
    Conflict {
        page_id: String,
        server_updated_at: DateTime<Utc>,
    },

    #[error("network failure: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Local errors
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for lattice operations
pub type Result<T> = std::result::Result<T, LatticeError>;

impl LatticeError {
    /// True when the error indicates the remote was unreachable or rejected
    /// the credential, i.e. the caller should continue local-only and retry
    /// opportunistically rather than surface a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatticeError::Network(_) | LatticeError::AuthenticationRequired
        )
    }
}

impl From<reqwest::Error> for LatticeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LatticeError::MalformedResponse(err.to_string())
        } else {
            LatticeError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LatticeError::Network("offline".into()).is_retryable());
        assert!(LatticeError::AuthenticationRequired.is_retryable());
        assert!(!LatticeError::Forbidden("page".into()).is_retryable());
        assert!(!LatticeError::MalformedResponse("bad json".into()).is_retryable());
    }
}
