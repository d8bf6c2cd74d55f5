//! Error types for the schema-change domain.
//!
//! Errors fall into four families, reported by [`Error::kind`]:
//!
//! - **Validation**: the request is rejected at submission (bad name, same-table
//!   conflict). Not retryable.
//! - **Transient**: storage faults and lease contention. Retried with backoff;
//!   persisted job progress is untouched.
//! - **Semantic**: discovered while a job is mid-transition (duplicate values
//!   under a new unique index, an unconvertible value). The job rolls back.
//! - **Stale schema**: a statement ran against an outdated schema or an expired
//!   lease. Retryable by the caller.

use keel_core::id::{JobId, TableId};

/// The result type used throughout keel-ddl.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected request; retrying will not help.
    Validation,
    /// Infrastructure fault; retry with backoff.
    Transient,
    /// Data or metadata makes the change impossible; roll back.
    Semantic,
    /// The caller used an outdated schema; retry the statement.
    StaleSchema,
    /// A bug or broken invariant.
    Internal,
}

/// Errors that can occur in schema-change operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A table with the same name already exists.
    #[error("table '{name}' already exists")]
    TableExists {
        /// Conflicting table name.
        name: String,
    },

    /// The referenced table does not exist.
    #[error("table '{name}' doesn't exist")]
    TableNotExists {
        /// Missing table name or ID.
        name: String,
    },

    /// The referenced database does not exist.
    #[error("database '{name}' doesn't exist")]
    DatabaseNotExists {
        /// Missing database name.
        name: String,
    },

    /// A column with the same name already exists.
    #[error("duplicate column name '{name}'")]
    DuplicateColumn {
        /// Conflicting column name.
        name: String,
    },

    /// The referenced column does not exist.
    #[error("column {name} doesn't exist")]
    ColumnNotExists {
        /// Missing column name.
        name: String,
    },

    /// An index with the same name already exists.
    #[error("index already exists: {name}")]
    IndexExists {
        /// Conflicting index name.
        name: String,
    },

    /// The referenced index does not exist.
    #[error("index {name} doesn't exist")]
    IndexNotExists {
        /// Missing index name.
        name: String,
    },

    /// A second primary key was requested.
    #[error("multiple primary key defined")]
    MultiplePrimaryKey,

    /// The requested column change is not supported.
    #[error("unsupported modify column: {reason}")]
    UnsupportedModifyColumn {
        /// Why the change is rejected.
        reason: String,
    },

    /// The column cannot be dropped.
    #[error("can't drop column '{column}': {reason}")]
    CantDropColumn {
        /// Column name.
        column: String,
        /// Why the drop is rejected.
        reason: String,
    },

    /// The request is malformed.
    #[error("invalid DDL request: {0}")]
    InvalidRequest(String),

    /// Another job is in flight on the same table.
    #[error("table {table_id} is busy with DDL job {job_id}; try again later")]
    TableBusy {
        /// Busy table.
        table_id: TableId,
        /// In-flight job.
        job_id: JobId,
    },

    /// The schema changed underneath the request or statement.
    #[error(
        "information schema is changed during the execution of the statement; try again later"
    )]
    SchemaChanged,

    /// The node's schema lease lapsed before it could refresh.
    #[error("schema lease expired at version {version}; try again later")]
    SchemaLeaseExpired {
        /// Last version the node loaded.
        version: u64,
    },

    /// A unique constraint would be violated.
    #[error("duplicate entry '{entry}' for key '{index}'")]
    DuplicateEntry {
        /// Index name.
        index: String,
        /// Offending value.
        entry: String,
    },

    /// A value cannot be converted to the column type.
    #[error("data truncated for column '{column}': {reason}")]
    DataTruncated {
        /// Column name.
        column: String,
        /// Conversion failure.
        reason: String,
    },

    /// A NULL was written to a NOT NULL column.
    #[error("column '{column}' cannot be null")]
    BadNull {
        /// Column name.
        column: String,
    },

    /// A statement referenced a column that is not visible.
    #[error("unknown column '{column}'")]
    UnknownColumn {
        /// Column name.
        column: String,
    },

    /// The job is unknown.
    #[error("DDL job {job_id} not found")]
    JobNotFound {
        /// Requested job.
        job_id: JobId,
    },

    /// The job finished unsuccessfully.
    #[error("DDL job {job_id} failed: {message}")]
    JobFailed {
        /// Failed job.
        job_id: JobId,
        /// Terminal error text recorded on the job.
        message: String,
    },

    /// The job can no longer be cancelled.
    #[error("DDL job {job_id} cannot be cancelled in schema state {schema_state}")]
    CannotCancel {
        /// Job that was asked to cancel.
        job_id: JobId,
        /// Its current schema state.
        schema_state: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// This process no longer holds the DDL owner lease.
    #[error("DDL owner lease lost")]
    OwnerLost,

    /// A wait did not finish in time.
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
    },

    /// A fault injected by a hook.
    #[error("injected fault: {0}")]
    Injected(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from the core layer.
    #[error(transparent)]
    Core(#[from] keel_core::error::Error),

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
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

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TableExists { .. }
            | Self::TableNotExists { .. }
            | Self::DatabaseNotExists { .. }
            | Self::DuplicateColumn { .. }
            | Self::ColumnNotExists { .. }
            | Self::IndexExists { .. }
            | Self::IndexNotExists { .. }
            | Self::MultiplePrimaryKey
            | Self::UnsupportedModifyColumn { .. }
            | Self::CantDropColumn { .. }
            | Self::InvalidRequest(_)
            | Self::TableBusy { .. }
            | Self::UnknownColumn { .. }
            | Self::JobNotFound { .. }
            | Self::JobFailed { .. }
            | Self::CannotCancel { .. }
            | Self::Config(_) => ErrorKind::Validation,
            Self::SchemaChanged | Self::SchemaLeaseExpired { .. } => ErrorKind::StaleSchema,
            Self::DuplicateEntry { .. } | Self::DataTruncated { .. } | Self::BadNull { .. } => {
                ErrorKind::Semantic
            }
            Self::OwnerLost | Self::Timeout { .. } | Self::Injected(_) | Self::Storage { .. } => {
                ErrorKind::Transient
            }
            Self::Core(inner) if inner.is_retryable() => ErrorKind::Transient,
            Self::Core(_) | Self::InvalidStateTransition { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if the failed operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::StaleSchema)
    }

    /// Returns true if a write-write conflict in the store caused this error.
    #[must_use]
    pub const fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Self::Core(keel_core::error::Error::WriteConflict { .. })
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(keel_core::error::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_messages_are_stable() {
        assert_eq!(
            Error::IndexExists {
                name: "idx_b".into()
            }
            .to_string(),
            "index already exists: idx_b"
        );
        assert_eq!(
            Error::MultiplePrimaryKey.to_string(),
            "multiple primary key defined"
        );
        assert_eq!(
            Error::DuplicateColumn { name: "aa".into() }.to_string(),
            "duplicate column name 'aa'"
        );
        assert_eq!(
            Error::ColumnNotExists { name: "c".into() }.to_string(),
            "column c doesn't exist"
        );
    }

    #[test]
    fn schema_changed_is_retryable_stale_schema() {
        let err = Error::SchemaChanged;
        assert_eq!(err.kind(), ErrorKind::StaleSchema);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("try again later"));
    }

    #[test]
    fn core_conflicts_are_transient() {
        let err = Error::from(keel_core::error::Error::WriteConflict {
            key: "ddl/job_seq".into(),
            start_ts: 1,
            committed_ts: 2,
        });
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_write_conflict());

        let err = Error::from(keel_core::error::Error::InvalidInput("x".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn semantic_errors_are_not_retryable() {
        let err = Error::DuplicateEntry {
            index: "uk".into(),
            entry: "1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Semantic);
        assert!(!err.is_retryable());
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "done".into(),
            to: "running".into(),
            reason: "job is terminal".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition: done -> running (job is terminal)"
        );
    }
}
