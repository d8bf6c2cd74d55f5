//! Per-operation state transitions.
//!
//! Every job type implements [`Transition`]: one call to [`Transition::step`]
//! moves the job's object exactly one schema state forward, one call to
//! [`Transition::rollback_step`] one state back. The runner commits each call
//! in its own transaction together with the schema version it publishes.
//!
//! Dispatch is a match over [`JobType`] returning a unit struct per family:
//!
//! - [`table::CreateTable`], [`table::DropTable`], [`table::TruncateTable`],
//!   [`table::RenameTable`]
//! - [`column::AddColumn`] and [`column::DropColumn`] (also their
//!   multi-column forms), [`column::ModifyColumn`], [`column::SetDefaultValue`]
//! - [`index::AddIndex`] (also primary keys), [`index::DropIndex`]
//! - [`database::DropDatabase`]

pub mod column;
pub mod database;
pub mod index;
pub mod table;

use async_trait::async_trait;
use keel_core::id::TableId;
use keel_core::kv::{KeyRange, Transaction};

use crate::error::{Error, Result};
use crate::model::{Job, JobState, JobType, SchemaState, TableInfo};
use crate::reorg::{self, ReorgTask};
use crate::schema::{Meta, SchemaDiff, TableChange};

/// What a step asks of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's writes are ready to commit.
    Commit,
    /// Existing data must be reorganized before the job can move on; the step
    /// made no changes.
    Reorg(ReorgTask),
}

/// Everything one step reads and writes.
#[derive(Debug)]
pub struct StepContext {
    /// Transaction the step commits in.
    pub txn: Transaction,
    /// The job, as it will be persisted.
    pub job: Job,
    /// Diff of the version this step publishes.
    pub diff: SchemaDiff,
    /// Table definitions the version changes.
    pub changes: Vec<TableChange>,
    /// Data ranges to purge once the job is archived.
    pub delete_ranges: Vec<KeyRange>,
}

impl StepContext {
    /// Starts a step for `job`.
    #[must_use]
    pub fn new(txn: Transaction, job: Job) -> Self {
        let diff = SchemaDiff::for_job(job.id, job.job_type, job.schema_id);
        Self {
            txn,
            job,
            diff,
            changes: Vec::new(),
            delete_ranges: Vec::new(),
        }
    }

    /// Metadata access through the step's transaction.
    pub fn meta(&mut self) -> Meta<'_> {
        Meta::new(&mut self.txn)
    }

    /// Latest definition of the job's table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotExists`] if it is gone.
    pub async fn table(&mut self) -> Result<TableInfo> {
        let id = self.job.table_id;
        self.meta().require_table(id).await
    }

    /// Publishes `table` with the job's object now in `state`.
    pub fn advance(&mut self, table: TableInfo, state: SchemaState) {
        self.job.schema_state = state;
        self.changes.push(TableChange::Upsert(table));
    }

    /// Publishes the removal of a table.
    pub fn remove_table(&mut self, id: TableId) {
        self.changes.push(TableChange::Remove(id));
    }

    /// Marks the job done.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not running.
    pub fn finish(&mut self) -> Result<()> {
        self.job.transition_to(JobState::Done, "reached final schema state")
    }

    /// Marks the rollback complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not rolling back.
    pub fn finish_rollback(&mut self) -> Result<()> {
        self.job
            .transition_to(JobState::RollbackDone, "rolled back to original schema")
    }

    /// Returns true if the step publishes a new schema version.
    #[must_use]
    pub fn publishes(&self) -> bool {
        !self.changes.is_empty() || self.diff.identity_changed || self.diff.database_changed
    }

    /// Returns the processed row count if `task` has completed; `None` means
    /// the runner still has to run it.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn reorg_done(&mut self, task: &ReorgTask) -> Result<Option<u64>> {
        let rows = reorg::finished_rows(&self.txn, self.job.id, task).await?;
        if let Some(rows) = rows {
            self.job.row_count = i64::try_from(rows).unwrap_or(i64::MAX);
            reorg::clear(&mut self.txn, self.job.id).await?;
        }
        Ok(rows)
    }

    /// Discards reorganization state after an aborted run.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn discard_reorg(&mut self) -> Result<()> {
        reorg::clear(&mut self.txn, self.job.id).await
    }
}

/// One operation's path through the schema states.
#[async_trait]
pub trait Transition: Send + Sync {
    /// Schema state the job starts in when dequeued.
    fn initial_state(&self) -> SchemaState {
        SchemaState::None
    }

    /// Advances the job one state.
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome>;

    /// Retraces the job one state toward where it started, marking the
    /// rollback done once nothing is left to undo.
    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()>;
}

/// Returns the transition implementing `job_type`.
#[must_use]
pub fn handler(job_type: JobType) -> &'static dyn Transition {
    match job_type {
        JobType::CreateTable => &table::CreateTable,
        JobType::DropTable => &table::DropTable,
        JobType::TruncateTable => &table::TruncateTable,
        JobType::RenameTable => &table::RenameTable,
        JobType::AddColumn | JobType::AddColumns => &column::AddColumn,
        JobType::DropColumn | JobType::DropColumns => &column::DropColumn,
        JobType::ModifyColumn => &column::ModifyColumn,
        JobType::SetDefaultValue => &column::SetDefaultValue,
        JobType::AddIndex | JobType::AddPrimaryKey => &index::AddIndex,
        JobType::DropIndex | JobType::DropPrimaryKey => &index::DropIndex,
        JobType::DropDatabase => &database::DropDatabase,
    }
}

fn unexpected_state(job: &Job) -> Error {
    Error::InvalidStateTransition {
        from: job.schema_state.to_string(),
        to: "next".into(),
        reason: format!("{} has no transition from this state", job.job_type),
    }
}

/// Rollback of a single-step job: nothing was published before the job
/// finished, so there is nothing to undo.
fn rollback_nothing(ctx: &mut StepContext) -> Result<()> {
    ctx.finish_rollback()
}

/// Rollback of a drop: possible only while the object is still maintained by
/// writes, where it returns to public.
fn rollback_drop(
    ctx: &mut StepContext,
    restore: impl FnOnce(&mut TableInfo) -> Result<()>,
    table: Option<TableInfo>,
) -> Result<()> {
    match (ctx.job.schema_state, table) {
        (SchemaState::WriteOnly, Some(mut table)) => {
            restore(&mut table)?;
            ctx.advance(table, SchemaState::Public);
            ctx.finish_rollback()
        }
        (SchemaState::Public | SchemaState::None, _) => {
            ctx.job.schema_state = SchemaState::Public;
            ctx.finish_rollback()
        }
        _ => Err(Error::CannotCancel {
            job_id: ctx.job.id,
            schema_state: ctx.job.schema_state.to_string(),
        }),
    }
}
