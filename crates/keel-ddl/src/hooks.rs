//! Lifecycle observation points.
//!
//! A [`DdlHook`] is passed to the owner explicitly; the default
//! [`NoopHook`] does nothing. Test harnesses use hooks to inspect
//! intermediate states, run statements at a chosen schema state, delay a job
//! or inject faults.
//!
//! Hooks returning `Err` fail the current step; the runner treats the error
//! like any other (an [`Error::Injected`](crate::error::Error::Injected) fault
//! is transient and retried).

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Job;

/// Observer of job execution.
#[async_trait]
pub trait DdlHook: Send + Sync + 'static {
    /// Called before a queued job is moved to running.
    async fn before_dequeue(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called after the dequeue committed.
    async fn after_dequeue(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called before a step's transaction commits; `job` holds the state
    /// being left.
    async fn before_state_commit(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called after a step committed; `job` holds the new state.
    async fn after_state_commit(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called after each committed backfill chunk.
    async fn after_backfill_chunk(&self, _job: &Job, _range: usize, _rows: usize) -> Result<()> {
        Ok(())
    }

    /// Called once the job is archived.
    async fn on_job_finished(&self, _job: &Job) {}
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl DdlHook for NoopHook {}
