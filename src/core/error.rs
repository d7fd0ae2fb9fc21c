use thiserror::Error;

/// Failure reported by the Remote Authority, classified for retry decisions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network unreachable, timeout, 5xx. The entry stays queued.
    #[error("transient remote failure: {message}")]
    Transient { message: String },

    /// Validation rejection, missing record. Retrying the entry as-is cannot succeed.
    #[error("permanent remote failure ({}): {message}", status.map(|s| s.to_string()).unwrap_or_else(|| "no status".to_string()))]
    Permanent { status: Option<u16>, message: String },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: message.into(),
        }
    }

    /// Classifies an HTTP status code.
    ///
    /// 408, 425, 429 and every 5xx are retryable; every other 4xx is final.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 425 | 429 | 500..=599 => Self::transient(format!("HTTP {}: {}", status, message.into())),
            _ => Self::permanent(Some(status), message),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Permanent { status: Some(404), .. })
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A confirmed Create found no provisional record to re-key.
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(RemoteError::from_status(503, "unavailable").is_transient());
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(RemoteError::from_status(408, "timeout").is_transient());
        assert!(!RemoteError::from_status(422, "bad amount").is_transient());
        assert!(RemoteError::from_status(404, "gone").is_not_found());
    }

    #[test]
    fn remote_error_converts_into_sync_error() {
        let err: SyncError = RemoteError::permanent(Some(400), "rejected").into();
        assert!(matches!(err, SyncError::Remote(RemoteError::Permanent { .. })));
        assert!(err.to_string().contains("rejected"));
    }
}
