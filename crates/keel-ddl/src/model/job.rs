//! DDL jobs and submission requests.

use chrono::Utc;
use keel_core::id::{ColumnId, IndexId, JobId, SchemaId, TableId};
use serde::{Deserialize, Serialize};

use super::meta::{names_eq, ColumnDef, ColumnPosition, Datum, IndexDef, TableDef, PRIMARY_KEY_NAME};
use super::state::{JobState, SchemaState};
use crate::error::{Error, Result};

/// Kind of structural change a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// `CREATE TABLE`.
    CreateTable,
    /// `DROP TABLE`.
    DropTable,
    /// `TRUNCATE TABLE`.
    TruncateTable,
    /// `RENAME TABLE`.
    RenameTable,
    /// `ADD COLUMN`.
    AddColumn,
    /// `DROP COLUMN`.
    DropColumn,
    /// `MODIFY COLUMN` / `CHANGE COLUMN`.
    ModifyColumn,
    /// `ALTER COLUMN ... SET DEFAULT`.
    SetDefaultValue,
    /// `ADD INDEX` / `CREATE INDEX`.
    AddIndex,
    /// `DROP INDEX`.
    DropIndex,
    /// `ADD PRIMARY KEY`.
    AddPrimaryKey,
    /// `DROP PRIMARY KEY`.
    DropPrimaryKey,
    /// Several `ADD COLUMN` clauses in one statement.
    AddColumns,
    /// Several `DROP COLUMN` clauses in one statement.
    DropColumns,
    /// `DROP DATABASE`.
    DropDatabase,
}

impl JobType {
    /// Returns true if the job replaces or removes the table's identity, so
    /// statements planned against the old identity must be re-planned.
    #[must_use]
    pub const fn changes_table_identity(&self) -> bool {
        matches!(
            self,
            Self::DropTable | Self::TruncateTable | Self::RenameTable
        )
    }

    /// Returns true for jobs that walk the drop path.
    #[must_use]
    pub const fn is_drop(&self) -> bool {
        matches!(
            self,
            Self::DropTable
                | Self::DropColumn
                | Self::DropColumns
                | Self::DropIndex
                | Self::DropPrimaryKey
                | Self::DropDatabase
        )
    }

    /// Returns true for jobs on a whole database rather than one table.
    #[must_use]
    pub const fn is_database_level(&self) -> bool {
        matches!(self, Self::DropDatabase)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::TruncateTable => "truncate_table",
            Self::RenameTable => "rename_table",
            Self::AddColumn => "add_column",
            Self::DropColumn => "drop_column",
            Self::ModifyColumn => "modify_column",
            Self::SetDefaultValue => "set_default_value",
            Self::AddIndex => "add_index",
            Self::DropIndex => "drop_index",
            Self::AddPrimaryKey => "add_primary_key",
            Self::DropPrimaryKey => "drop_primary_key",
            Self::AddColumns => "add_columns",
            Self::DropColumns => "drop_columns",
            Self::DropDatabase => "drop_database",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Table ID recorded on jobs that target no single table.
pub const NO_TABLE: TableId = TableId::new(0);

/// One clause of a multi-column `ADD COLUMN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewColumn {
    /// New column.
    pub column: ColumnDef,
    /// Placement.
    #[serde(default)]
    pub position: ColumnPosition,
}

impl NewColumn {
    /// A column appended at the end.
    #[must_use]
    pub fn new(column: ColumnDef) -> Self {
        Self {
            column,
            position: ColumnPosition::Default,
        }
    }

    /// Places the column.
    #[must_use]
    pub fn at(mut self, position: ColumnPosition) -> Self {
        self.position = position;
        self
    }
}

/// Type-specific arguments. Never modified after the job is first committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobArgs {
    /// Create a table.
    CreateTable {
        /// Full definition.
        table: TableDef,
    },
    /// Drop the target table.
    DropTable,
    /// Replace the target table with an empty one under a new ID.
    TruncateTable,
    /// Rename the target table.
    RenameTable {
        /// New name.
        new_name: String,
    },
    /// Add a column.
    AddColumn {
        /// New column.
        column: ColumnDef,
        /// Placement.
        #[serde(default)]
        position: ColumnPosition,
    },
    /// Drop a column.
    DropColumn {
        /// Column name.
        name: String,
    },
    /// Change a column's name, type or attributes.
    ModifyColumn {
        /// Existing column name.
        name: String,
        /// Replacement definition.
        column: ColumnDef,
        /// Placement.
        #[serde(default)]
        position: ColumnPosition,
    },
    /// Change a column's default.
    SetDefaultValue {
        /// Column name.
        name: String,
        /// New default, or none to drop it.
        default: Option<Datum>,
    },
    /// Add a secondary index or primary key.
    AddIndex {
        /// Index definition.
        index: IndexDef,
    },
    /// Drop a secondary index or the primary key.
    DropIndex {
        /// Index name.
        name: String,
    },
    /// Add several columns in one job.
    AddColumns {
        /// New columns, placed in order.
        columns: Vec<NewColumn>,
    },
    /// Drop several columns in one job.
    DropColumns {
        /// Column names.
        names: Vec<String>,
    },
    /// Drop the target database and every table in it.
    DropDatabase,
}

impl JobArgs {
    /// The job type these arguments describe.
    #[must_use]
    pub fn job_type(&self) -> JobType {
        match self {
            Self::CreateTable { .. } => JobType::CreateTable,
            Self::DropTable => JobType::DropTable,
            Self::TruncateTable => JobType::TruncateTable,
            Self::RenameTable { .. } => JobType::RenameTable,
            Self::AddColumn { .. } => JobType::AddColumn,
            Self::DropColumn { .. } => JobType::DropColumn,
            Self::ModifyColumn { .. } => JobType::ModifyColumn,
            Self::SetDefaultValue { .. } => JobType::SetDefaultValue,
            Self::AddIndex { index } if index.primary => JobType::AddPrimaryKey,
            Self::AddIndex { .. } => JobType::AddIndex,
            Self::DropIndex { name } if names_eq(name, PRIMARY_KEY_NAME) => {
                JobType::DropPrimaryKey
            }
            Self::DropIndex { .. } => JobType::DropIndex,
            Self::AddColumns { .. } => JobType::AddColumns,
            Self::DropColumns { .. } => JobType::DropColumns,
            Self::DropDatabase => JobType::DropDatabase,
        }
    }
}

/// Facts recorded while the job runs. Unlike [`JobArgs`], the owner updates
/// these as objects get allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Column being added, dropped or changed.
    pub column_id: Option<ColumnId>,
    /// Every column a multi-column job adds or drops, in clause order.
    #[serde(default)]
    pub column_ids: Vec<ColumnId>,
    /// Hidden column that replaces `column_id` after a retype.
    pub changing_column_id: Option<ColumnId>,
    /// Index being added or dropped.
    pub index_id: Option<IndexId>,
    /// Table ID that replaces the target after a truncate.
    pub new_table_id: Option<TableId>,
    /// The change rewrites stored data.
    pub needs_reorg: bool,
}

/// A submission request derived from a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Target database.
    pub schema_id: SchemaId,
    /// Target table; `None` for `CREATE TABLE`.
    pub table_id: Option<TableId>,
    /// Operation arguments.
    pub args: JobArgs,
    /// Schema version the statement was planned against; `0` if unknown.
    pub planned_version: u64,
    /// `IF EXISTS`: a missing target makes the request a no-op.
    pub if_exists: bool,
    /// `IF NOT EXISTS`: an existing object makes the request a no-op.
    pub if_not_exists: bool,
    /// Table name as written, for requests whose table did not resolve.
    pub table_name: Option<String>,
}

impl JobRequest {
    /// Creates a request against an existing table.
    #[must_use]
    pub fn new(schema_id: SchemaId, table_id: TableId, args: JobArgs) -> Self {
        Self {
            schema_id,
            table_id: Some(table_id),
            args,
            planned_version: 0,
            if_exists: false,
            if_not_exists: false,
            table_name: None,
        }
    }

    /// Creates a request against a table that did not resolve when the
    /// statement was planned.
    #[must_use]
    pub fn unresolved(schema_id: SchemaId, table_name: impl Into<String>, args: JobArgs) -> Self {
        Self {
            schema_id,
            table_id: None,
            args,
            planned_version: 0,
            if_exists: false,
            if_not_exists: false,
            table_name: Some(table_name.into()),
        }
    }

    /// Creates a `DROP DATABASE` request.
    #[must_use]
    pub fn drop_database(schema_id: SchemaId) -> Self {
        Self {
            schema_id,
            table_id: None,
            args: JobArgs::DropDatabase,
            planned_version: 0,
            if_exists: false,
            if_not_exists: false,
            table_name: None,
        }
    }

    /// Creates a `CREATE TABLE` request.
    #[must_use]
    pub fn create_table(schema_id: SchemaId, table: TableDef) -> Self {
        Self {
            schema_id,
            table_id: None,
            args: JobArgs::CreateTable { table },
            planned_version: 0,
            if_exists: false,
            if_not_exists: false,
            table_name: None,
        }
    }

    /// Records the schema version the statement was planned against.
    #[must_use]
    pub const fn planned_at(mut self, version: u64) -> Self {
        self.planned_version = version;
        self
    }

    /// Marks the statement `IF EXISTS`.
    #[must_use]
    pub const fn if_exists(mut self) -> Self {
        self.if_exists = true;
        self
    }

    /// Marks the statement `IF NOT EXISTS`.
    #[must_use]
    pub const fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// The job type of this request.
    #[must_use]
    pub fn job_type(&self) -> JobType {
        self.args.job_type()
    }
}

/// A persisted DDL job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, monotonically increasing ID.
    pub id: JobId,
    /// Operation kind.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Target database.
    pub schema_id: SchemaId,
    /// Target table (allocated at submission for `CREATE TABLE`);
    /// [`NO_TABLE`] for database jobs and skipped requests that named a
    /// missing table.
    pub table_id: TableId,
    /// Target table name at submission.
    pub table_name: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Visibility state of the changing object.
    pub schema_state: SchemaState,
    /// Immutable operation arguments.
    pub args: JobArgs,
    /// Submission time (unix milliseconds).
    pub start_ts: i64,
    /// Error that caused a rollback, or the last transient error.
    pub error: Option<String>,
    /// Why an `IF [NOT] EXISTS` request finished without doing anything.
    #[serde(default)]
    pub warning: Option<String>,
    /// Number of errors encountered.
    pub error_count: u32,
    /// Rows processed by backfill.
    pub row_count: i64,
    /// Schema version the request was planned against.
    pub planned_version: u64,
    /// Schema version published by the latest step.
    pub schema_version: u64,
    /// Runtime allocations.
    #[serde(default)]
    pub progress: JobProgress,
    /// Completion time (unix milliseconds).
    pub finished_at: Option<i64>,
}

impl Job {
    /// Builds a queued job from a validated request.
    #[must_use]
    pub fn from_request(
        id: JobId,
        table_id: TableId,
        table_name: impl Into<String>,
        request: JobRequest,
    ) -> Self {
        let job_type = request.job_type();
        Self {
            id,
            job_type,
            schema_id: request.schema_id,
            table_id,
            table_name: table_name.into(),
            state: JobState::None,
            schema_state: SchemaState::None,
            args: request.args,
            start_ts: Utc::now().timestamp_millis(),
            error: None,
            warning: None,
            error_count: 0,
            row_count: 0,
            planned_version: request.planned_version,
            schema_version: 0,
            progress: JobProgress::default(),
            finished_at: None,
        }
    }

    /// Builds the archived record of a request that turned out to be a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifecycle forbids finishing a new job.
    pub fn skipped(
        id: JobId,
        table_id: TableId,
        table_name: impl Into<String>,
        request: JobRequest,
        warning: String,
    ) -> Result<Self> {
        let schema_state = if request.if_not_exists {
            SchemaState::Public
        } else {
            SchemaState::None
        };
        let mut job = Self::from_request(id, table_id, table_name, request);
        job.transition_to(JobState::Running, "validated")?;
        job.transition_to(JobState::Done, "nothing to do")?;
        job.schema_state = schema_state;
        job.warning = Some(warning);
        Ok(job)
    }

    /// Moves the job to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the lifecycle forbids it.
    pub fn transition_to(&mut self, next: JobState, reason: &str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
                reason: reason.to_string(),
            });
        }
        self.state = next;
        if next.is_finished() {
            self.finished_at = Some(Utc::now().timestamp_millis());
        }
        Ok(())
    }

    /// Returns true if a cancel request can still take effect.
    ///
    /// Add-type jobs roll back from any non-terminal state. Drop-type jobs
    /// only before their object has stopped being maintained by writes.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        match self.state {
            JobState::None => true,
            JobState::Running if self.job_type.is_drop() => {
                matches!(self.schema_state, SchemaState::Public | SchemaState::WriteOnly)
            }
            JobState::Running => true,
            JobState::RollingBack
            | JobState::RollbackDone
            | JobState::Done
            | JobState::Cancelled => false,
        }
    }

    /// Returns a lowercase description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "job {} ({}) on table {} state={} schema_state={}",
            self.id, self.job_type, self.table_id, self.state, self.schema_state
        )
    }
}
