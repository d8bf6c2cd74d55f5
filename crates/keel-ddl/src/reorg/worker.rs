//! Parallel, checkpointed backfill workers.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use keel_core::kv::{key_successor, KeyRange, Snapshot, Timestamp, Transaction, TxnStore};
use tracing::{debug, info, warn};

use super::{split_range, Checkpoint, KeySample, ReorgMeta, ReorgTask, SAMPLE_KEYS_PER_WORKER};
use crate::config::ReorgConfig;
use crate::error::{Error, Result};
use crate::hooks::DdlHook;
use crate::keys;
use crate::metrics::DdlMetrics;
use crate::model::{ColumnInfo, IndexInfo, Job, SchemaState, TableInfo};
use crate::owner::OwnerLease;
use crate::queue;
use crate::table::codec::{self, RowValue};
use crate::table::{check_primary_not_null, convert_for_changing, entry_display, index_entry};

/// How a backfill run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgProgress {
    /// Every range is done.
    Finished {
        /// Keys processed in total.
        rows: u64,
    },
    /// Stopped early because cancellation was requested; checkpoints hold the
    /// progress made.
    Interrupted,
}

/// The task resolved against the table definition it runs for.
enum Resolved<'a> {
    AddIndex(&'a IndexInfo),
    ModifyColumn {
        from: &'a ColumnInfo,
        to: &'a ColumnInfo,
    },
    PurgeColumns(Vec<keel_core::id::ColumnId>),
    PurgeIndex,
}

fn resolve<'a>(table: &'a TableInfo, task: &ReorgTask) -> Result<Resolved<'a>> {
    let missing = || Error::internal(format!("reorg target of {} vanished from table {}", task.as_label(), table.name));
    Ok(match *task {
        ReorgTask::AddIndex { index_id } => Resolved::AddIndex(table.index(index_id).ok_or_else(missing)?),
        ReorgTask::ModifyColumn { from, to } => Resolved::ModifyColumn {
            from: table.column(from).ok_or_else(missing)?,
            to: table.column(to).ok_or_else(missing)?,
        },
        ReorgTask::PurgeColumn { column } => Resolved::PurgeColumns(vec![column]),
        ReorgTask::PurgeColumns => Resolved::PurgeColumns(
            table
                .columns
                .iter()
                .filter(|c| c.state == SchemaState::DeleteReorganization)
                .map(|c| c.id)
                .collect(),
        ),
        ReorgTask::PurgeIndex { .. } => Resolved::PurgeIndex,
    })
}

/// Runs reorganizations for the owner.
#[derive(Clone)]
pub struct Backfill {
    store: Arc<dyn TxnStore>,
    config: ReorgConfig,
    hook: Arc<dyn DdlHook>,
    lease: OwnerLease,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for Backfill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfill")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Backfill {
    /// Creates a backfill runner acting under `lease`.
    #[must_use]
    pub fn new(
        store: Arc<dyn TxnStore>,
        config: ReorgConfig,
        hook: Arc<dyn DdlHook>,
        lease: OwnerLease,
    ) -> Self {
        Self {
            store,
            config,
            hook,
            lease,
            metrics: DdlMetrics::new(),
        }
    }

    /// Runs (or resumes) `task` for `job` over `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEntry`], [`Error::DataTruncated`] or
    /// [`Error::BadNull`] when existing data violates the change, or a
    /// transient error; committed chunks survive either way.
    #[tracing::instrument(skip(self, job, table), fields(job_id = %job.id, task = task.as_label()))]
    pub async fn run(&self, job: &Job, table: &TableInfo, task: &ReorgTask) -> Result<ReorgProgress> {
        resolve(table, task)?;
        let meta = self.prepare(job, table, task).await?;
        if meta.finished {
            return Ok(ReorgProgress::Finished { rows: meta.rows });
        }

        let workers = meta
            .ranges
            .iter()
            .enumerate()
            .map(|(n, (start, end))| self.run_range(job, table, task, &meta, n, KeyRange::new(start.clone(), end.clone())));
        let completed = try_join_all(workers).await?;
        if completed.iter().any(|done| !done) {
            info!("backfill interrupted by cancellation");
            return Ok(ReorgProgress::Interrupted);
        }

        self.lease.ensure_valid()?;
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let mut rows = 0;
        for n in 0..meta.ranges.len() {
            let checkpoint: Option<Checkpoint> = txn.get_json(keys::reorg_range(job.id, n).as_bytes()).await?;
            rows += checkpoint.map_or(0, |c| c.rows_done);
        }
        let finished = ReorgMeta {
            finished: true,
            rows,
            ..meta
        };
        txn.put_json(keys::reorg_meta(job.id), &finished)?;
        txn.commit().await?;
        info!(rows, "backfill finished");
        Ok(ReorgProgress::Finished { rows })
    }

    /// Loads the layout of a started run, or fixes the snapshot and splits
    /// the key space for a new one.
    async fn prepare(&self, job: &Job, table: &TableInfo, task: &ReorgTask) -> Result<ReorgMeta> {
        self.lease.ensure_valid()?;
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        if let Some(meta) = super::load_meta(&txn, job.id).await? {
            if meta.task == *task {
                debug!(snapshot_ts = meta.snapshot_ts, ranges = meta.ranges.len(), "resuming backfill");
                return Ok(meta);
            }
            warn!("discarding reorg state of a different task");
            super::clear(&mut txn, job.id).await?;
        }

        let snapshot_ts = txn.start_ts();
        let range = task.scan_range(table.id);
        let sample = self.sample_keys(snapshot_ts, &range).await?;
        let ranges = split_range(&range, sample.keys(), self.config.workers);
        for (n, (start, _)) in ranges.iter().enumerate() {
            txn.put_json(
                keys::reorg_range(job.id, n),
                &Checkpoint {
                    next_key: start.clone(),
                    done: false,
                    rows_done: 0,
                },
            )?;
        }
        let meta = ReorgMeta {
            task: *task,
            snapshot_ts,
            ranges,
            finished: false,
            rows: 0,
        };
        txn.put_json(keys::reorg_meta(job.id), &meta)?;
        txn.commit().await?;
        info!(snapshot_ts, keys = sample.seen(), ranges = meta.ranges.len(), "backfill started");
        Ok(meta)
    }

    /// Pages through `range` at the snapshot keeping only a bounded sample of
    /// split points.
    async fn sample_keys(&self, snapshot_ts: Timestamp, range: &KeyRange) -> Result<KeySample> {
        let snapshot = Snapshot::at(Arc::clone(&self.store), snapshot_ts);
        let mut sample = KeySample::new(self.config.workers.max(1) * SAMPLE_KEYS_PER_WORKER);
        let page_size = self.config.batch_size.max(1);
        let mut cursor = range.clone();
        loop {
            let page = snapshot.scan(&cursor, page_size).await?;
            for (key, _) in &page {
                sample.offer(key);
            }
            match page.last() {
                Some((last, _)) if page.len() == page_size => {
                    cursor = cursor.with_start(key_successor(last));
                }
                _ => return Ok(sample),
            }
        }
    }

    /// Processes one range chunk by chunk. Returns false if cancellation
    /// stopped it.
    async fn run_range(
        &self,
        job: &Job,
        table: &TableInfo,
        task: &ReorgTask,
        meta: &ReorgMeta,
        n: usize,
        range: KeyRange,
    ) -> Result<bool> {
        let resolved = resolve(table, task)?;
        let snapshot = Snapshot::at(Arc::clone(&self.store), meta.snapshot_ts);
        let checkpoint_key = keys::reorg_range(job.id, n);
        loop {
            self.lease.ensure_valid()?;
            let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
            if queue::cancel_requested(&txn, job.id).await? && job.is_cancellable() {
                return Ok(false);
            }
            let mut checkpoint: Checkpoint = txn
                .get_json(checkpoint_key.as_bytes())
                .await?
                .ok_or_else(|| Error::internal(format!("missing checkpoint {n} of job {}", job.id)))?;
            if checkpoint.done {
                return Ok(true);
            }

            let page = snapshot
                .scan(&range.with_start(checkpoint.next_key.clone()), self.config.batch_size)
                .await?;
            for (key, value) in &page {
                self.apply(&mut txn, table, &resolved, meta, key, value).await?;
            }

            let rows = page.len();
            if let Some((last, _)) = page.last() {
                checkpoint.next_key = key_successor(last);
            }
            checkpoint.rows_done += rows as u64;
            checkpoint.done = rows < self.config.batch_size;
            txn.put_json(checkpoint_key.clone(), &checkpoint)?;
            txn.commit().await?;

            self.metrics.record_backfill_rows(job.job_type.as_label(), rows as u64);
            debug!(range = n, rows, done = checkpoint.done, "backfill chunk committed");
            self.hook.after_backfill_chunk(job, n, rows).await?;
            if checkpoint.done {
                return Ok(true);
            }
        }
    }

    /// Buffers the write for one scanned key.
    ///
    /// Rows rewritten or deleted after the snapshot are skipped: foreground
    /// writes already maintain the object being built. The conditional writes
    /// close the window between this read and the commit.
    async fn apply(
        &self,
        txn: &mut Transaction,
        table: &TableInfo,
        resolved: &Resolved<'_>,
        meta: &ReorgMeta,
        key: &Bytes,
        value: &Bytes,
    ) -> Result<()> {
        if let Resolved::PurgeIndex = resolved {
            txn.delete(key.clone());
            return Ok(());
        }
        if txn.get(key).await?.as_ref() != Some(value) {
            return Ok(());
        }
        let handle = codec::decode_record_handle(key)?;
        let mut row = RowValue::decode(value)?;

        match resolved {
            Resolved::AddIndex(index) => {
                let entry = index_entry(table, index, &row.cells, handle)?;
                check_primary_not_null(table, index, &entry)?;
                if entry.distinct {
                    match txn.get(&entry.key).await? {
                        Some(existing) if codec::decode_unique_index_value(&existing)? == handle => {
                            return Ok(());
                        }
                        Some(_) => {
                            return Err(Error::DuplicateEntry {
                                index: index.name.clone(),
                                entry: entry_display(&entry.values),
                            });
                        }
                        None => {}
                    }
                    let since = txn.start_ts();
                    txn.assert_unchanged(entry.key.clone(), since);
                }
                txn.put_if_unchanged(entry.key, entry.value, vec![key.clone()], meta.snapshot_ts);
            }
            Resolved::ModifyColumn { from, to } => {
                let converted = convert_for_changing(from, to, &row.cells)?;
                row.cells.insert(to.id, converted);
                txn.put_if_unchanged(key.clone(), row.encode()?, Vec::new(), meta.snapshot_ts);
            }
            Resolved::PurgeColumns(columns) => {
                let mut purged = false;
                for column in columns {
                    purged |= row.cells.remove(column).is_some();
                }
                if purged {
                    txn.put_if_unchanged(key.clone(), row.encode()?, Vec::new(), meta.snapshot_ts);
                }
            }
            Resolved::PurgeIndex => {}
        }
        Ok(())
    }
}
