use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures surfaced by the sync engine and its collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// HTTP >= 500, unexpected status or connection failure.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// HTTP 404. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("content mismatch for {path}: expected {expected}, got {actual}")]
    ContentMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("not enough free space: need {needed} bytes, {available} available")]
    StorageFull { needed: u64, available: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn io(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Io(format!("{context}: {err}"))
    }

    pub fn parse(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Parse(format!("{context}: {err}"))
    }

    /// Map an HTTP status outside 2xx onto an error kind.
    pub fn from_status(url: &str, status: u16) -> Self {
        if status == 404 {
            Self::NotFound(url.to_owned())
        } else {
            Self::NetworkTransient(format!("{url} returned status {status}"))
        }
    }

    /// Whether the retry scheduler may try the failed operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkTransient(_)
                | SyncError::ContentMismatch { .. }
                | SyncError::Decompression(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(SyncError::NetworkTransient("reset".into()).is_retryable());
        assert!(SyncError::Decompression("bad zip".into()).is_retryable());
        assert!(
            SyncError::ContentMismatch {
                path: "a.png".into(),
                expected: "h1".into(),
                actual: "h2".into(),
            }
            .is_retryable()
        );
        assert!(!SyncError::NotFound("x".into()).is_retryable());
        assert!(
            !SyncError::StorageFull {
                needed: 10,
                available: 1
            }
            .is_retryable()
        );
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn maps_http_status_codes() {
        assert_eq!(
            SyncError::from_status("http://h/m.json", 404),
            SyncError::NotFound("http://h/m.json".into())
        );
        assert!(matches!(
            SyncError::from_status("http://h/m.json", 503),
            SyncError::NetworkTransient(_)
        ));
        assert!(SyncError::from_status("u", 403).is_retryable());
    }
}
