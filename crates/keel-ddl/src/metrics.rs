//! Metrics for DDL execution.
//!
//! Recorded through the `metrics` crate facade; without an installed recorder
//! every call is a no-op.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `keel_ddl_jobs_submitted_total` | Counter | `job_type` |
//! | `keel_ddl_jobs_finished_total` | Counter | `job_type`, `outcome` |
//! | `keel_ddl_state_transitions_total` | Counter | `job_type`, `from_state`, `to_state` |
//! | `keel_ddl_retries_total` | Counter | `job_type` |
//! | `keel_ddl_retry_budget_exceeded_total` | Counter | `job_type`, `state` |
//! | `keel_ddl_backfill_rows_total` | Counter | `job_type` |
//! | `keel_ddl_step_duration_seconds` | Histogram | `job_type` |
//! | `keel_ddl_convergence_wait_seconds` | Histogram | `outcome` |
//! | `keel_ddl_active_jobs` | Gauge | - |
//! | `keel_ddl_schema_version` | Gauge | - |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: jobs accepted into the queue.
    pub const JOBS_SUBMITTED_TOTAL: &str = "keel_ddl_jobs_submitted_total";
    /// Counter: jobs archived, by outcome.
    pub const JOBS_FINISHED_TOTAL: &str = "keel_ddl_jobs_finished_total";
    /// Counter: schema state transitions.
    pub const STATE_TRANSITIONS_TOTAL: &str = "keel_ddl_state_transitions_total";
    /// Counter: retried transient failures.
    pub const RETRIES_TOTAL: &str = "keel_ddl_retries_total";
    /// Counter: jobs that ran out of retries but cannot roll back.
    pub const RETRY_BUDGET_EXCEEDED_TOTAL: &str = "keel_ddl_retry_budget_exceeded_total";
    /// Counter: rows processed by backfill.
    pub const BACKFILL_ROWS_TOTAL: &str = "keel_ddl_backfill_rows_total";
    /// Histogram: duration of one job step.
    pub const STEP_DURATION_SECONDS: &str = "keel_ddl_step_duration_seconds";
    /// Histogram: time spent waiting for schema convergence.
    pub const CONVERGENCE_WAIT_SECONDS: &str = "keel_ddl_convergence_wait_seconds";
    /// Gauge: jobs being driven by this owner.
    pub const ACTIVE_JOBS: &str = "keel_ddl_active_jobs";
    /// Gauge: latest schema version seen by this process.
    pub const SCHEMA_VERSION: &str = "keel_ddl_schema_version";
}

/// Metric label keys.
pub mod labels {
    /// Job type.
    pub const JOB_TYPE: &str = "job_type";
    /// Terminal job state or wait result.
    pub const OUTCOME: &str = "outcome";
    /// Previous schema state.
    pub const FROM_STATE: &str = "from_state";
    /// New schema state.
    pub const TO_STATE: &str = "to_state";
    /// Job state.
    pub const STATE: &str = "state";
}

/// Recorder for DDL metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DdlMetrics;

impl DdlMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an accepted submission.
    pub fn record_submitted(&self, job_type: &str) {
        counter!(names::JOBS_SUBMITTED_TOTAL, labels::JOB_TYPE => job_type.to_string())
            .increment(1);
    }

    /// Records an archived job.
    pub fn record_finished(&self, job_type: &str, outcome: &str) {
        counter!(
            names::JOBS_FINISHED_TOTAL,
            labels::JOB_TYPE => job_type.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a published schema state change.
    pub fn record_transition(&self, job_type: &str, from_state: &str, to_state: &str) {
        counter!(
            names::STATE_TRANSITIONS_TOTAL,
            labels::JOB_TYPE => job_type.to_string(),
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a retried transient failure.
    pub fn record_retry(&self, job_type: &str) {
        counter!(names::RETRIES_TOTAL, labels::JOB_TYPE => job_type.to_string()).increment(1);
    }

    /// Records a job that exhausted its retries without a way back.
    pub fn record_retry_budget_exceeded(&self, job_type: &str, state: &str) {
        counter!(
            names::RETRY_BUDGET_EXCEEDED_TOTAL,
            labels::JOB_TYPE => job_type.to_string(),
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Records backfilled rows.
    pub fn record_backfill_rows(&self, job_type: &str, rows: u64) {
        counter!(names::BACKFILL_ROWS_TOTAL, labels::JOB_TYPE => job_type.to_string())
            .increment(rows);
    }

    /// Records the duration of one job step.
    pub fn observe_step_duration(&self, job_type: &str, duration: Duration) {
        histogram!(names::STEP_DURATION_SECONDS, labels::JOB_TYPE => job_type.to_string())
            .record(duration.as_secs_f64());
    }

    /// Records a convergence wait.
    pub fn observe_convergence_wait(&self, outcome: &str, duration: Duration) {
        histogram!(names::CONVERGENCE_WAIT_SECONDS, labels::OUTCOME => outcome.to_string())
            .record(duration.as_secs_f64());
    }

    /// Sets the number of jobs being driven.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_jobs(&self, count: usize) {
        gauge!(names::ACTIVE_JOBS).set(count as f64);
    }

    /// Sets the latest schema version seen.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_schema_version(&self, version: u64) {
        gauge!(names::SCHEMA_VERSION).set(version as f64);
    }
}

/// Calls a closure with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Times one job step.
#[must_use]
pub fn time_step(job_type: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| DdlMetrics::new().observe_step_duration(job_type, duration))
}
