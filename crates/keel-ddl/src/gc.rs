//! Garbage collection of dropped data and old metadata.
//!
//! Two kinds of garbage accumulate:
//!
//! - **Delete ranges**: dropping or truncating a table (or rolling back an
//!   index add) leaves its rows or entries in the store. The step that
//!   removes the object records the key range in the same transaction; the
//!   owner purges it once the job is archived and no live node can still be
//!   using a version that sees the object.
//! - **Metadata history**: per-table definitions and diffs below the oldest
//!   version any live node observes.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use keel_core::id::JobId;
use keel_core::kv::{KeyRange, Transaction, TxnStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::keys;
use crate::lease::SchemaSyncer;
use crate::model::SchemaState;
use crate::queue;
use crate::schema::Meta;

/// Keys deleted per purge transaction.
const PURGE_BATCH: usize = 512;

/// A recorded range awaiting purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeRecord {
    /// Job that removed the object.
    pub job_id: JobId,
    /// First key.
    pub start: Bytes,
    /// End key (exclusive, empty for unbounded).
    pub end: Bytes,
    /// Version that made the data unreachable.
    pub version: u64,
}

/// Records `ranges` for `job` inside the step's transaction.
///
/// # Errors
///
/// Returns an error if the scan or encode fails.
pub async fn record_delete_ranges(
    txn: &mut Transaction,
    job_id: JobId,
    ranges: &[KeyRange],
    version: u64,
) -> Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }
    let existing = txn
        .scan_all(&KeyRange::prefix(keys::delete_range_prefix(job_id).as_bytes()))
        .await?
        .len();
    for (n, range) in ranges.iter().enumerate() {
        let record = DeleteRangeRecord {
            job_id,
            start: range.start.clone(),
            end: range.end.clone(),
            version,
        };
        txn.put_json(keys::delete_range(job_id, existing + n), &record)?;
    }
    Ok(())
}

/// Lists recorded ranges.
///
/// # Errors
///
/// Returns an error if the scan or decode fails.
pub async fn pending_delete_ranges(txn: &Transaction) -> Result<Vec<(Bytes, DeleteRangeRecord)>> {
    txn.scan_all(&KeyRange::prefix(keys::DELETE_RANGE_PREFIX.as_bytes()))
        .await?
        .into_iter()
        .map(|(key, raw)| Ok((key, serde_json::from_slice(&raw).map_err(Error::from)?)))
        .collect()
}

/// What one collection pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Delete ranges fully purged.
    pub ranges_purged: usize,
    /// Data keys deleted.
    pub keys_deleted: usize,
    /// Metadata history entries pruned.
    pub history_pruned: usize,
}

/// Owner-side collector.
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn TxnStore>,
    syncer: SchemaSyncer,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector").finish_non_exhaustive()
    }
}

impl GarbageCollector {
    /// Creates a collector.
    #[must_use]
    pub fn new(store: Arc<dyn TxnStore>, syncer: SchemaSyncer) -> Self {
        Self { store, syncer }
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; work already committed stays done.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) -> Result<GcReport> {
        let latest = {
            let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
            Meta::new(&mut txn).schema_version().await?
        };
        let safe_version = self.syncer.min_live_version().await?.unwrap_or(latest);

        let mut report = GcReport::default();
        self.purge_ranges(safe_version, &mut report).await?;
        report.history_pruned = self.prune_history(safe_version).await?;
        if report != GcReport::default() {
            info!(
                ranges = report.ranges_purged,
                keys = report.keys_deleted,
                history = report.history_pruned,
                "garbage collected"
            );
        }
        Ok(report)
    }

    async fn purge_ranges(&self, safe_version: u64, report: &mut GcReport) -> Result<()> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let active: BTreeSet<JobId> = queue::list_active(&txn)
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect();
        let pending = pending_delete_ranges(&txn).await?;
        drop(txn);

        for (key, record) in pending {
            if active.contains(&record.job_id) || record.version > safe_version {
                continue;
            }
            report.keys_deleted += self.purge(&record).await?;
            let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
            txn.delete(key);
            txn.commit().await?;
            report.ranges_purged += 1;
            debug!(job_id = %record.job_id, version = record.version, "delete range purged");
        }
        Ok(())
    }

    async fn purge(&self, record: &DeleteRangeRecord) -> Result<usize> {
        let range = KeyRange::new(record.start.clone(), record.end.clone());
        let mut deleted = 0;
        loop {
            let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
            let page = txn.scan(&range, PURGE_BATCH).await?;
            let n = page.len();
            for (key, _) in page {
                txn.delete(key);
            }
            txn.commit().await?;
            deleted += n;
            if n < PURGE_BATCH {
                return Ok(deleted);
            }
        }
    }

    async fn prune_history(&self, safe_version: u64) -> Result<usize> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        // Definitions an in-flight purge may still be reading stay retained.
        let keep_from = queue::list_active(&txn)
            .await?
            .iter()
            .filter(|j| j.schema_state == SchemaState::DeleteReorganization)
            .map(|j| j.planned_version)
            .fold(safe_version, u64::min);
        let pruned = Meta::new(&mut txn).prune_history(keep_from).await?;
        if pruned > 0 {
            txn.commit().await?;
        }
        Ok(pruned)
    }
}
