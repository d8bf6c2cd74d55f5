//! Durable FIFO of DDL jobs.
//!
//! Active jobs live under `ddl/queue/{id}`, archived ones under
//! `ddl/history/{id}`. Every enqueue bumps `ddl/job_seq` inside the same
//! transaction that validates the request against the in-flight jobs, so two
//! concurrent submissions are serialized by a write conflict on the sequence
//! key and the loser re-validates against the winner.

use std::sync::Arc;

use keel_core::id::{JobId, TableId};
use keel_core::kv::{KeyRange, Transaction, TxnStore};
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics::DdlMetrics;
use crate::model::{Job, JobArgs, JobRequest, JobState, NO_TABLE};
use crate::schema::Meta;
use crate::validate::{self, Validated};

/// Reads an active job.
///
/// # Errors
///
/// Returns an error if the read or decode fails.
pub async fn load_active(txn: &Transaction, id: JobId) -> Result<Option<Job>> {
    Ok(txn.get_json(keys::queued_job(id).as_bytes()).await?)
}

/// Lists active jobs in submission order.
///
/// # Errors
///
/// Returns an error if the scan or decode fails.
pub async fn list_active(txn: &Transaction) -> Result<Vec<Job>> {
    let pairs = txn
        .scan_all(&KeyRange::prefix(keys::QUEUE_PREFIX.as_bytes()))
        .await?;
    pairs
        .iter()
        .map(|(_, raw)| serde_json::from_slice(raw).map_err(Error::from))
        .collect()
}

async fn next_seq(txn: &mut Transaction) -> Result<i64> {
    let seq = txn.get_json::<i64>(keys::JOB_SEQ.as_bytes()).await?.unwrap_or(0) + 1;
    txn.put_json(keys::JOB_SEQ, &seq)?;
    Ok(seq)
}

/// Persists an active job.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn save_active(txn: &mut Transaction, job: &Job) -> Result<()> {
    txn.put_json(keys::queued_job(job.id), job)?;
    Ok(())
}

/// Moves a finished job from the queue to history.
///
/// # Errors
///
/// Returns an error if the job is not finished or encoding fails.
pub fn archive(txn: &mut Transaction, job: &Job) -> Result<()> {
    if !job.state.is_terminal() {
        return Err(Error::InvalidStateTransition {
            from: job.state.to_string(),
            to: "archived".into(),
            reason: "only terminal jobs are archived".into(),
        });
    }
    txn.delete(keys::queued_job(job.id));
    txn.delete(keys::cancel(job.id));
    txn.put_json(keys::history_job(job.id), job)?;
    Ok(())
}

/// Returns true if cancellation of `id` was requested.
///
/// # Errors
///
/// Returns an error if the read fails.
pub async fn cancel_requested(txn: &Transaction, id: JobId) -> Result<bool> {
    Ok(txn.get(keys::cancel(id).as_bytes()).await?.is_some())
}

/// Client of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn TxnStore>,
    retry: RetryConfig,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue client.
    #[must_use]
    pub fn new(store: Arc<dyn TxnStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            metrics: DdlMetrics::new(),
        }
    }

    /// Validates and durably enqueues a request, returning the new job's ID.
    ///
    /// # Errors
    ///
    /// Returns a validation or conflict error, or a storage error once
    /// retries on write conflicts are exhausted.
    #[tracing::instrument(skip(self, request), fields(job_type = %request.job_type()))]
    pub async fn enqueue(&self, request: JobRequest) -> Result<JobId> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_enqueue(&request).await {
                Ok(job) if job.state.is_terminal() => {
                    info!(
                        job_id = %job.id,
                        warning = job.warning.as_deref().unwrap_or_default(),
                        "DDL request had nothing to do"
                    );
                    return Ok(job.id);
                }
                Ok(job) => {
                    info!(job_id = %job.id, table_id = %job.table_id, "DDL job enqueued");
                    self.metrics.record_submitted(job.job_type.as_label());
                    return Ok(job.id);
                }
                Err(e) if e.is_write_conflict() && attempt < self.retry.max_attempts => {
                    debug!(attempt, "enqueue raced with another submission; retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_enqueue(&self, request: &JobRequest) -> Result<Job> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let active = list_active(&txn).await?;

        let validated = validate::validate(&Meta::new(&mut txn), &active, request).await?;
        let (target, request) = match validated {
            Validated::Job { target, request } => (target, request),
            Validated::Skip { target, warning } => {
                let seq = next_seq(&mut txn).await?;
                let job = Job::skipped(
                    JobId::new(seq),
                    target.table_id.unwrap_or(NO_TABLE),
                    target.table_name,
                    request.clone(),
                    warning,
                )?;
                archive(&mut txn, &job)?;
                txn.commit().await?;
                return Ok(job);
            }
        };
        let table_id = match target.table_id {
            Some(id) => id,
            None => {
                let ids = Meta::new(&mut txn).alloc_global_ids(1).await?;
                let id = ids
                    .first()
                    .copied()
                    .ok_or_else(|| Error::internal("ID allocator returned nothing"))?;
                TableId::new(id)
            }
        };

        let seq = next_seq(&mut txn).await?;
        let job = Job::from_request(JobId::new(seq), table_id, target.table_name, request);
        save_active(&mut txn, &job)?;
        txn.commit().await?;
        Ok(job)
    }

    /// Lists active jobs in submission order.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn active_jobs(&self) -> Result<Vec<Job>> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        list_active(&txn).await
    }

    /// Reads a job, active or archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        if let Some(job) = load_active(&txn, id).await? {
            return Ok(Some(job));
        }
        Ok(txn.get_json(keys::history_job(id).as_bytes()).await?)
    }

    /// Lists archived jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn history(&self, limit: usize) -> Result<Vec<Job>> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let pairs = txn
            .scan_all(&KeyRange::prefix(keys::HISTORY_PREFIX.as_bytes()))
            .await?;
        pairs
            .iter()
            .rev()
            .take(limit)
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Error::from))
            .collect()
    }

    /// Requests cancellation.
    ///
    /// A job still waiting in the queue is archived as cancelled right away.
    /// A running job is flagged and rolls back at its next state boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for unknown or archived jobs and
    /// [`Error::CannotCancel`] once a drop has passed its point of no return.
    pub async fn request_cancel(&self, id: JobId) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_cancel(id).await {
                Err(e) if e.is_write_conflict() && attempt < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn try_cancel(&self, id: JobId) -> Result<()> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let Some(mut job) = load_active(&txn, id).await? else {
            return Err(Error::JobNotFound { job_id: id });
        };
        if !job.is_cancellable() {
            return Err(Error::CannotCancel {
                job_id: id,
                schema_state: job.schema_state.to_string(),
            });
        }
        if job.state == JobState::None {
            job.transition_to(JobState::Cancelled, "cancelled before dequeue")?;
            job.error = Some("cancelled by user".into());
            if let JobArgs::CreateTable { .. } = job.args {
                debug!(job_id = %id, "cancelled create table never allocated data");
            }
            archive(&mut txn, &job)?;
        } else {
            txn.put(keys::cancel(id), "1");
        }
        txn.commit().await?;
        info!(job_id = %id, "DDL job cancellation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_core::id::SchemaId;
    use keel_core::kv::MemoryStore;

    use super::*;
    use crate::model::{ColumnDef, FieldType, IndexDef, TableDef};

    async fn bootstrap(store: &Arc<dyn TxnStore>) -> Result<(SchemaId, TableId)> {
        let queue = JobQueue::new(Arc::clone(store), RetryConfig::default());
        let mut txn = Transaction::begin(Arc::clone(store)).await?;
        let db = Meta::new(&mut txn).create_database("test").await?;
        txn.commit().await?;
        let id = queue
            .enqueue(JobRequest::create_table(
                db.id,
                TableDef {
                    name: "t".into(),
                    columns: vec![
                        ColumnDef::new("a", FieldType::Int).primary_key(),
                        ColumnDef::new("b", FieldType::Int),
                    ],
                    indexes: Vec::new(),
                },
            ))
            .await?;
        let job = queue.get(id).await?.ok_or(Error::JobNotFound { job_id: id })?;
        Ok((db.id, job.table_id))
    }

    #[tokio::test]
    async fn enqueue_assigns_increasing_ids() -> Result<()> {
        let store = MemoryStore::shared();
        let (db, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(Arc::clone(&store), RetryConfig::default());
        let second = queue
            .enqueue(JobRequest::create_table(
                db,
                TableDef {
                    name: "u".into(),
                    columns: vec![ColumnDef::new("x", FieldType::Int)],
                    indexes: Vec::new(),
                },
            ))
            .await?;
        let active = queue.active_jobs().await?;
        assert_eq!(active.len(), 2);
        assert!(active[0].id < active[1].id);
        assert_eq!(active[1].id, second);
        assert!(active.iter().all(|j| j.state == JobState::None));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_pending_create_is_rejected() -> Result<()> {
        let store = MemoryStore::shared();
        let (db, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(store, RetryConfig::default());
        let err = queue
            .enqueue(JobRequest::create_table(
                db,
                TableDef {
                    name: "T".into(),
                    columns: vec![ColumnDef::new("x", FieldType::Int)],
                    indexes: Vec::new(),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "table 'T' already exists");
        Ok(())
    }

    #[tokio::test]
    async fn queued_jobs_cancel_immediately() -> Result<()> {
        let store = MemoryStore::shared();
        let (_, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(store, RetryConfig::default());
        let id = queue.active_jobs().await?[0].id;
        queue.request_cancel(id).await?;

        assert!(queue.active_jobs().await?.is_empty());
        let history = queue.history(10).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Cancelled);
        assert!(matches!(
            queue.request_cancel(id).await,
            Err(Error::JobNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn requests_against_missing_tables_fail() -> Result<()> {
        let store = MemoryStore::shared();
        let (db, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(store, RetryConfig::default());
        let err = queue
            .enqueue(JobRequest::new(
                db,
                TableId::new(999),
                JobArgs::AddIndex {
                    index: IndexDef::new("i", ["b"]),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TableNotExists { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn tolerated_requests_are_archived_as_done() -> Result<()> {
        let store = MemoryStore::shared();
        let (db, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(store, RetryConfig::default());
        let id = queue
            .enqueue(
                JobRequest::create_table(
                    db,
                    TableDef {
                        name: "t".into(),
                        columns: vec![ColumnDef::new("x", FieldType::Int)],
                        indexes: Vec::new(),
                    },
                )
                .if_not_exists(),
            )
            .await?;

        assert_eq!(queue.active_jobs().await?.len(), 1);
        let job = queue.get(id).await?.ok_or(Error::JobNotFound { job_id: id })?;
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.warning.as_deref(), Some("table 't' already exists"));
        assert_eq!(queue.history(10).await?[0].id, id);
        Ok(())
    }

    #[tokio::test]
    async fn pending_database_drop_fences_new_requests() -> Result<()> {
        let store = MemoryStore::shared();
        let (db, _) = bootstrap(&store).await?;
        let queue = JobQueue::new(store, RetryConfig::default());
        let drop = queue.enqueue(JobRequest::drop_database(db)).await?;
        let job = queue.get(drop).await?.ok_or(Error::JobNotFound { job_id: drop })?;
        assert_eq!(job.table_id, NO_TABLE);
        assert_eq!(job.table_name, "test");

        let err = queue
            .enqueue(JobRequest::create_table(
                db,
                TableDef {
                    name: "u".into(),
                    columns: vec![ColumnDef::new("x", FieldType::Int)],
                    indexes: Vec::new(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaChanged));

        let err = queue
            .enqueue(JobRequest::drop_database(db))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "database 'test' doesn't exist");
        let again = queue
            .enqueue(JobRequest::drop_database(db).if_exists())
            .await?;
        let again = queue.get(again).await?.ok_or(Error::JobNotFound { job_id: again })?;
        assert_eq!(again.state, JobState::Done);
        assert_eq!(queue.active_jobs().await?.len(), 2);
        Ok(())
    }
}
