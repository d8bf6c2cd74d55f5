//! Error types and result aliases for keel.
//!
//! Errors raised by the storage capability are structured so callers can tell a
//! transient fault (retry the transaction) from a programming or data error.

/// The result type used throughout keel-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transaction lost a write-write race to a newer commit.
    #[error("write conflict on key {key}: committed at {committed_ts} after start {start_ts}")]
    WriteConflict {
        /// Printable form of the contended key.
        key: String,
        /// Start timestamp of the losing transaction.
        start_ts: u64,
        /// Commit timestamp of the winning version.
        committed_ts: u64,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A key or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the enclosing transaction may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::WriteConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_storage_faults_are_retryable() {
        let conflict = Error::WriteConflict {
            key: "ddl/job_seq".into(),
            start_ts: 3,
            committed_ts: 5,
        };
        assert!(conflict.is_retryable());
        assert!(Error::storage("timeout").is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
        assert!(!Error::serialization("eof").is_retryable());
    }

    #[test]
    fn write_conflict_display_names_the_key() {
        let err = Error::WriteConflict {
            key: "m/schema_version".into(),
            start_ts: 10,
            committed_ts: 11,
        };
        assert_eq!(
            err.to_string(),
            "write conflict on key m/schema_version: committed at 11 after start 10"
        );
    }
}
