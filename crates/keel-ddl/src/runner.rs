//! Drives one job through its state machine.
//!
//! Each iteration reads the job, asks its [`Transition`] for one step and
//! commits the step, the schema version it publishes and the job record in
//! one transaction. The runner then waits for the cluster to converge on the
//! new version before taking the next step, so no two live nodes are ever more
//! than one state apart.
//!
//! Every iteration starts from the persisted record, which makes resumption
//! after failover the same code path as normal progress.
//!
//! [`Transition`]: crate::transition::Transition

use std::sync::Arc;
use std::time::Duration;

use keel_core::id::JobId;
use keel_core::kv::{Transaction, TxnStore};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::gc;
use crate::hooks::DdlHook;
use crate::lease::{Convergence, SchemaSyncer};
use crate::metrics::{time_step, DdlMetrics};
use crate::model::{Job, JobState, SchemaState};
use crate::owner::OwnerLease;
use crate::queue;
use crate::reorg::{Backfill, ReorgProgress};
use crate::schema::Meta;
use crate::transition::{handler, StepContext, StepOutcome};

/// Error text recorded on jobs cancelled by request.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Result of one iteration.
enum Step {
    Continue,
    Finished(Job),
    Gone,
}

/// Returns true if a failure may still undo the job.
///
/// Drops cannot come back once their object stopped being written.
fn can_roll_back(job: &Job) -> bool {
    job.state == JobState::Running
        && (!job.job_type.is_drop()
            || matches!(job.schema_state, SchemaState::Public | SchemaState::WriteOnly))
}

/// What a failed step leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    RollBack,
    /// The retry budget just ran out but the job can only move forward.
    BudgetExceeded,
    Retry,
}

/// Decides how to handle the `attempt`-th consecutive failure of `job`.
///
/// `BudgetExceeded` is reported once per streak of failures; later attempts
/// keep retrying quietly.
fn failure_action(job: &Job, retryable: bool, attempt: u32, max_attempts: u32) -> FailureAction {
    let exhausted = !retryable || attempt >= max_attempts;
    if !exhausted {
        return FailureAction::Retry;
    }
    if can_roll_back(job) {
        return FailureAction::RollBack;
    }
    let first = if retryable { attempt == max_attempts.max(1) } else { attempt == 1 };
    if first {
        FailureAction::BudgetExceeded
    } else {
        FailureAction::Retry
    }
}

fn jittered(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Runs jobs for the current owner.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn TxnStore>,
    syncer: SchemaSyncer,
    backfill: Backfill,
    hook: Arc<dyn DdlHook>,
    lease: OwnerLease,
    retry: RetryConfig,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// Creates a runner acting under `lease`.
    #[must_use]
    pub fn new(
        store: Arc<dyn TxnStore>,
        syncer: SchemaSyncer,
        backfill: Backfill,
        hook: Arc<dyn DdlHook>,
        lease: OwnerLease,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            syncer,
            backfill,
            hook,
            lease,
            retry,
            metrics: DdlMetrics::new(),
        }
    }

    /// Drives job `id` until it is archived.
    ///
    /// Returns the archived job, or `None` if it was no longer active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnerLost`] once the owner lease lapses; another
    /// owner resumes the job from its persisted state.
    #[tracing::instrument(skip(self), fields(job_id = %id))]
    pub async fn run(&self, id: JobId) -> Result<Option<Job>> {
        self.resume(id).await?;

        let mut attempt = 0_u32;
        loop {
            self.lease.ensure_valid()?;
            match self.step(id).await {
                Ok(Step::Continue) => attempt = 0,
                Ok(Step::Gone) => return Ok(None),
                Ok(Step::Finished(job)) => {
                    let outcome = if job.state == JobState::Done { "done" } else { "cancelled" };
                    self.metrics.record_finished(job.job_type.as_label(), outcome);
                    info!(state = %job.state, error = ?job.error, "job finished");
                    self.hook.on_job_finished(&job).await;
                    return Ok(Some(job));
                }
                Err(Error::OwnerLost) => return Err(Error::OwnerLost),
                Err(err) => {
                    attempt += 1;
                    if self.handle_failure(id, &err, attempt).await? {
                        attempt = 0;
                    }
                }
            }
        }
    }

    /// A job picked up mid-flight may have published a version its previous
    /// owner never saw converge.
    async fn resume(&self, id: JobId) -> Result<()> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        if let Some(job) = queue::load_active(&txn, id).await? {
            if job.state != JobState::None && job.schema_version > 0 {
                debug!(version = job.schema_version, "resuming job");
                self.converge(job.schema_version).await?;
            }
        }
        Ok(())
    }

    async fn converge(&self, version: u64) -> Result<()> {
        let ttl = self.syncer.config().ttl();
        if let Convergence::LeaseElapsed { lagging } =
            self.syncer.wait_for_convergence(version, ttl).await?
        {
            warn!(version, lagging = lagging.len(), "nodes fenced by lease expiry");
        }
        Ok(())
    }

    async fn step(&self, id: JobId) -> Result<Step> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let Some(mut job) = queue::load_active(&txn, id).await? else {
            return Ok(Step::Gone);
        };
        let transition = handler(job.job_type);
        let _timer = time_step(job.job_type.as_label());

        let dequeued = job.state == JobState::None;
        if dequeued {
            self.hook.before_dequeue(&job).await?;
            job.transition_to(JobState::Running, "dequeued by owner")?;
            job.schema_state = transition.initial_state();
        }

        if job.state == JobState::RollbackDone {
            job.transition_to(JobState::Cancelled, "rollback complete")?;
            queue::archive(&mut txn, &job)?;
            txn.commit().await?;
            return Ok(Step::Finished(job));
        }

        if job.state == JobState::Running
            && job.is_cancellable()
            && queue::cancel_requested(&txn, id).await?
        {
            info!(schema_state = %job.schema_state, "cancellation requested, rolling back");
            job.transition_to(JobState::RollingBack, CANCELLED_BY_USER)?;
            job.error = Some(CANCELLED_BY_USER.to_string());
        }

        let from = job.schema_state;
        self.hook.before_state_commit(&job).await?;
        let mut ctx = StepContext::new(txn, job);
        match ctx.job.state {
            JobState::Running => {
                if let StepOutcome::Reorg(task) = transition.step(&mut ctx).await? {
                    let StepContext { mut txn, job, .. } = ctx;
                    let table = Meta::new(&mut txn).require_table(job.table_id).await?;
                    drop(txn);
                    match self.backfill.run(&job, &table, &task).await? {
                        ReorgProgress::Finished { rows } => {
                            info!(rows, task = task.as_label(), "reorganization finished");
                        }
                        ReorgProgress::Interrupted => {
                            debug!("reorganization interrupted");
                        }
                    }
                    return Ok(Step::Continue);
                }
            }
            JobState::RollingBack => transition.rollback_step(&mut ctx).await?,
            JobState::None
            | JobState::RollbackDone
            | JobState::Done
            | JobState::Cancelled => {
                return Err(Error::internal(format!(
                    "cannot step {}",
                    ctx.job.describe()
                )));
            }
        }

        let publishes = ctx.publishes();
        let StepContext {
            mut txn,
            mut job,
            diff,
            changes,
            delete_ranges,
        } = ctx;
        if publishes {
            job.schema_version = Meta::new(&mut txn).publish(diff, changes).await?;
        }
        gc::record_delete_ranges(&mut txn, job.id, &delete_ranges, job.schema_version).await?;
        if job.state.is_terminal() {
            queue::archive(&mut txn, &job)?;
        } else {
            queue::save_active(&mut txn, &job)?;
        }
        self.lease.ensure_valid()?;
        txn.commit().await?;

        self.metrics.record_transition(
            job.job_type.as_label(),
            from.as_label(),
            job.schema_state.as_label(),
        );
        info!(
            state = %job.state,
            from = %from,
            schema_state = %job.schema_state,
            version = job.schema_version,
            "job step committed"
        );
        if dequeued {
            self.hook.after_dequeue(&job).await?;
        }
        if publishes {
            self.converge(job.schema_version).await?;
        }
        self.hook.after_state_commit(&job).await?;

        Ok(if job.state.is_terminal() {
            Step::Finished(job)
        } else {
            Step::Continue
        })
    }

    /// Records a failed step. Returns true if the job switched to rolling
    /// back.
    async fn handle_failure(&self, id: JobId, err: &Error, attempt: u32) -> Result<bool> {
        let recorded = self.record_failure(id, err, attempt).await;
        let rolled_back = match recorded {
            Ok(rolled_back) => rolled_back,
            Err(Error::OwnerLost) => return Err(Error::OwnerLost),
            Err(record_err) => {
                warn!(error = %record_err, "could not record job failure");
                false
            }
        };
        if !rolled_back {
            tokio::time::sleep(jittered(self.retry.backoff(attempt))).await;
        }
        Ok(rolled_back)
    }

    async fn record_failure(&self, id: JobId, err: &Error, attempt: u32) -> Result<bool> {
        self.lease.ensure_valid()?;
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let Some(mut job) = queue::load_active(&txn, id).await? else {
            return Ok(false);
        };
        job.error_count = job.error_count.saturating_add(1);
        job.error = Some(err.to_string());

        let exhausted = !err.is_retryable() || attempt >= self.retry.max_attempts;
        if exhausted && job.state == JobState::None {
            // The failed step also carried the dequeue.
            job.transition_to(JobState::Running, "dequeued by owner")?;
            job.schema_state = handler(job.job_type).initial_state();
        }
        let action = failure_action(&job, err.is_retryable(), attempt, self.retry.max_attempts);
        match action {
            FailureAction::RollBack => {
                warn!(error = %err, schema_state = %job.schema_state, "job failed, rolling back");
                job.transition_to(JobState::RollingBack, "step failed")?;
            }
            FailureAction::BudgetExceeded => {
                self.metrics
                    .record_retry_budget_exceeded(job.job_type.as_label(), job.state.as_label());
                error!(
                    error = %err,
                    state = %job.state,
                    schema_state = %job.schema_state,
                    attempt,
                    "retry budget exceeded; job cannot roll back from here and keeps retrying"
                );
            }
            FailureAction::Retry => {
                self.metrics.record_retry(job.job_type.as_label());
                warn!(error = %err, attempt, "job step failed, retrying");
            }
        }

        queue::save_active(&mut txn, &job)?;
        txn.commit().await?;
        Ok(action == FailureAction::RollBack)
    }
}
