//! The DDL owner loop.
//!
//! Every node runs a [`DdlOwner`]; only the one holding the owner lease does
//! any work. Each tick the owner renews (or campaigns for) the lease, then
//! starts a runner for the oldest active job of every idle table, up to
//! `max_concurrent_jobs`. Jobs on one table never overlap; jobs on different
//! tables proceed independently. A database-level job waits until every
//! older job in its database has finished.
//!
//! Garbage collection runs from the same loop once per lease TTL.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::id::{JobId, NodeId, TableId};
use keel_core::kv::TxnStore;
use keel_core::observability::ddl_job_span;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{DdlConfig, OwnerConfig};
use crate::error::{Error, Result};
use crate::gc::GarbageCollector;
use crate::hooks::DdlHook;
use crate::lease::SchemaSyncer;
use crate::metrics::DdlMetrics;
use crate::model::Job;
use crate::owner::{CampaignResult, OwnerElector, OwnerLease, RenewalResult};
use crate::queue::JobQueue;
use crate::reorg::Backfill;
use crate::runner::JobRunner;

type RunnerOutput = (TableId, JobId, Result<Option<Job>>);

/// Picks the jobs to start: the oldest active job of every table that has no
/// runner, in submission order, without exceeding `capacity` runners.
/// Database-level jobs start only once they are the oldest in their database.
#[must_use]
pub fn pick_runnable(active: &[Job], busy: &BTreeMap<TableId, JobId>, capacity: usize) -> Vec<JobId> {
    let mut seen = BTreeSet::new();
    let mut schemas = BTreeSet::new();
    let mut picked = Vec::new();
    let mut running = busy.len();
    let mut jobs: Vec<&Job> = active.iter().collect();
    jobs.sort_by_key(|j| j.id);
    for job in jobs {
        let first_in_schema = schemas.insert(job.schema_id);
        if job.job_type.is_database_level() && !first_in_schema {
            continue;
        }
        if !seen.insert(job.table_id) || busy.contains_key(&job.table_id) {
            continue;
        }
        if running >= capacity {
            break;
        }
        picked.push(job.id);
        running += 1;
    }
    picked
}

/// The per-node owner loop.
pub struct DdlOwner {
    node: NodeId,
    elector: Arc<dyn OwnerElector>,
    lease: OwnerLease,
    queue: JobQueue,
    runner: JobRunner,
    gc: GarbageCollector,
    config: OwnerConfig,
    gc_interval: Duration,
    wakeup: Arc<Notify>,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for DdlOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdlOwner")
            .field("node", &self.node)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DdlOwner {
    /// Wires an owner for `node`.
    #[must_use]
    pub fn new(
        node: NodeId,
        store: Arc<dyn TxnStore>,
        elector: Arc<dyn OwnerElector>,
        config: &DdlConfig,
        hook: Arc<dyn DdlHook>,
    ) -> Self {
        let lease = OwnerLease::new();
        let syncer = SchemaSyncer::new(Arc::clone(&store), config.lease.clone());
        let backfill = Backfill::new(
            Arc::clone(&store),
            config.reorg.clone(),
            Arc::clone(&hook),
            lease.clone(),
        );
        let runner = JobRunner::new(
            Arc::clone(&store),
            syncer.clone(),
            backfill,
            hook,
            lease.clone(),
            config.retry.clone(),
        );
        Self {
            node,
            elector,
            lease,
            queue: JobQueue::new(Arc::clone(&store), config.retry.clone()),
            runner,
            gc: GarbageCollector::new(store, syncer),
            config: config.owner.clone(),
            gc_interval: config.lease.ttl(),
            wakeup: Arc::new(Notify::new()),
            metrics: DdlMetrics::new(),
        }
    }

    /// This node's ownership handle.
    #[must_use]
    pub fn lease(&self) -> OwnerLease {
        self.lease.clone()
    }

    /// Handle that wakes the loop early, e.g. right after a submission.
    #[must_use]
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Runs the loop on a background task until `shutdown` flips to true.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the loop until `shutdown` flips to true.
    #[tracing::instrument(skip_all, fields(node = %self.node))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut running: JoinSet<RunnerOutput> = JoinSet::new();
        let mut busy: BTreeMap<TableId, JobId> = BTreeMap::new();
        let mut last_gc = Instant::now();

        loop {
            if let Err(err) = self.tick(&mut running, &mut busy).await {
                warn!(error = %err, "DDL owner tick failed");
            }
            if self.lease.is_valid() && last_gc.elapsed() >= self.gc_interval {
                last_gc = Instant::now();
                if let Err(err) = self.gc.collect().await {
                    warn!(error = %err, "garbage collection failed");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = self.wakeup.notified() => {}
                () = tokio::time::sleep(self.config.poll_interval()) => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    Self::reap(joined, &mut busy);
                }
            }
        }

        running.abort_all();
        while running.join_next().await.is_some() {}
        self.resign().await;
    }

    fn reap(
        joined: std::result::Result<RunnerOutput, tokio::task::JoinError>,
        busy: &mut BTreeMap<TableId, JobId>,
    ) {
        match joined {
            Ok((table, job_id, result)) => {
                busy.remove(&table);
                match result {
                    Ok(Some(job)) => debug!(job_id = %job.id, state = %job.state, "runner finished"),
                    Ok(None) => debug!(%job_id, "job was no longer active"),
                    Err(Error::OwnerLost) => info!(%job_id, "runner stopped: ownership lost"),
                    Err(err) => error!(%job_id, error = %err, "runner failed"),
                }
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(error = %err, "runner panicked");
            }
        }
    }

    async fn tick(
        &self,
        running: &mut JoinSet<RunnerOutput>,
        busy: &mut BTreeMap<TableId, JobId>,
    ) -> Result<()> {
        if !self.hold_ownership().await? {
            if !running.is_empty() {
                running.abort_all();
                while running.join_next().await.is_some() {}
            }
            busy.clear();
            return Ok(());
        }
        if running.is_empty() {
            busy.clear();
        }

        let active = self.queue.active_jobs().await?;
        for id in pick_runnable(&active, busy, self.config.max_concurrent_jobs) {
            let Some(job) = active.iter().find(|j| j.id == id) else {
                continue;
            };
            let table = job.table_id;
            busy.insert(table, id);
            debug!(job_id = %id, table_id = %table, "starting runner");
            let runner = self.runner.clone();
            let span = ddl_job_span(job.job_type.as_label(), id, table);
            running.spawn(async move { (table, id, runner.run(id).await) }.instrument(span));
        }
        self.metrics.set_active_jobs(busy.len());
        Ok(())
    }

    /// Renews the lease if held, campaigns otherwise. Returns true while
    /// this node is the owner.
    async fn hold_ownership(&self) -> Result<bool> {
        if let Some(token) = self.lease.token().filter(|_| self.lease.is_valid()) {
            return match self.elector.renew(self.node, &token).await? {
                RenewalResult::Renewed { lease_duration } => {
                    self.lease.extend(lease_duration)?;
                    Ok(true)
                }
                RenewalResult::Lost => {
                    warn!("DDL owner lease lost");
                    self.lease.revoke();
                    Ok(false)
                }
            };
        }

        match self.elector.campaign(self.node).await? {
            CampaignResult::Acquired {
                token,
                lease_duration,
            } => {
                self.lease.grant(token, lease_duration)?;
                info!("became DDL owner");
                Ok(true)
            }
            CampaignResult::NotOwner { .. } => {
                self.lease.revoke();
                Ok(false)
            }
        }
    }

    async fn resign(&self) {
        let Some(token) = self.lease.token() else {
            return;
        };
        self.lease.revoke();
        match self.elector.resign(self.node, &token).await {
            Ok(true) => info!("resigned DDL ownership"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "failed to resign DDL ownership"),
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_core::id::SchemaId;

    use super::*;
    use crate::model::{JobArgs, JobRequest, NO_TABLE};

    fn job(id: i64, table: i64) -> Job {
        let request = JobRequest::new(
            SchemaId::new(1),
            TableId::new(table),
            JobArgs::RenameTable {
                new_name: format!("t{id}"),
            },
        );
        Job::from_request(JobId::new(id), TableId::new(table), "t", request)
    }

    fn drop_database(id: i64, schema: i64) -> Job {
        Job::from_request(
            JobId::new(id),
            NO_TABLE,
            "test",
            JobRequest::drop_database(SchemaId::new(schema)),
        )
    }

    #[test]
    fn one_runner_per_table_in_submission_order() {
        let active = vec![job(3, 10), job(1, 10), job(2, 20)];
        let picked = pick_runnable(&active, &BTreeMap::new(), 8);
        assert_eq!(picked, vec![JobId::new(1), JobId::new(2)]);
    }

    #[test]
    fn busy_tables_and_capacity_are_respected() {
        let active = vec![job(1, 10), job(2, 20), job(3, 30), job(4, 40)];
        let busy = BTreeMap::from([(TableId::new(10), JobId::new(1))]);
        let picked = pick_runnable(&active, &busy, 3);
        assert_eq!(picked, vec![JobId::new(2), JobId::new(3)]);
    }

    #[test]
    fn database_jobs_wait_for_older_jobs_in_their_database() {
        let active = vec![job(1, 10), drop_database(2, 1), job(3, 20)];
        let picked = pick_runnable(&active, &BTreeMap::new(), 8);
        assert_eq!(picked, vec![JobId::new(1), JobId::new(3)]);

        let active = vec![drop_database(2, 1), job(3, 20)];
        let picked = pick_runnable(&active, &BTreeMap::new(), 8);
        assert_eq!(picked, vec![JobId::new(2), JobId::new(3)]);

        let other_database = vec![job(1, 10), drop_database(2, 5)];
        let picked = pick_runnable(&other_database, &BTreeMap::new(), 8);
        assert_eq!(picked, vec![JobId::new(1), JobId::new(2)]);
    }
}
