//! Background reorganization of existing data.
//!
//! During `WriteReorganization` (adds) and `DeleteReorganization` (drops) the
//! owner rewrites data written before the change started: index entries for
//! a new index, converted cells for a retyped column, leftovers of a dropped
//! column or index.
//!
//! A reorganization scans a snapshot fixed when it starts, split into
//! disjoint ranges that a bounded pool of workers process in parallel. Each
//! worker commits one chunk at a time together with its range checkpoint, so
//! a new owner resumes exactly after the last committed chunk.
//!
//! State layout per job:
//!
//! ```text
//! ddl/reorg/{job_id}/meta         ReorgMeta: task, snapshot_ts, ranges, finished
//! ddl/reorg/{job_id}/range/{n}    Checkpoint: next_key, done, rows_done
//! ```

pub mod worker;

pub use worker::{Backfill, ReorgProgress};

use bytes::Bytes;
use keel_core::id::{ColumnId, IndexId, JobId, TableId};
use keel_core::kv::{KeyRange, Timestamp, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys;
use crate::table::codec;

/// What a reorganization does to each key it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReorgTask {
    /// Write the entry of a new index for every row.
    AddIndex {
        /// Index being built.
        index_id: IndexId,
    },
    /// Fill the hidden column replacing `from` with converted values.
    ModifyColumn {
        /// Column being retyped.
        from: ColumnId,
        /// Hidden replacement column.
        to: ColumnId,
    },
    /// Remove a dropped column's cells from every row.
    PurgeColumn {
        /// Column being dropped.
        column: ColumnId,
    },
    /// Remove the cells of every column the table has in
    /// delete-reorganization from every row.
    PurgeColumns,
    /// Delete every entry of a dropped index.
    PurgeIndex {
        /// Index being dropped.
        index_id: IndexId,
    },
}

impl ReorgTask {
    /// Keys the task visits.
    #[must_use]
    pub fn scan_range(&self, table: TableId) -> KeyRange {
        match self {
            Self::PurgeIndex { index_id } => {
                KeyRange::prefix(&codec::index_prefix(table, *index_id))
            }
            Self::AddIndex { .. }
            | Self::ModifyColumn { .. }
            | Self::PurgeColumn { .. }
            | Self::PurgeColumns => codec::record_range(table),
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::AddIndex { .. } => "add_index",
            Self::ModifyColumn { .. } => "modify_column",
            Self::PurgeColumn { .. } => "purge_column",
            Self::PurgeColumns => "purge_columns",
            Self::PurgeIndex { .. } => "purge_index",
        }
    }
}

/// Persisted layout of one reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgMeta {
    /// Task being run.
    pub task: ReorgTask,
    /// Snapshot every range is scanned at.
    pub snapshot_ts: Timestamp,
    /// Disjoint `[start, end)` ranges, one per worker.
    pub ranges: Vec<(Bytes, Bytes)>,
    /// Every range completed.
    pub finished: bool,
    /// Keys processed across all ranges.
    pub rows: u64,
}

/// Per-range progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First key not yet processed.
    pub next_key: Bytes,
    /// The range is exhausted.
    pub done: bool,
    /// Keys processed in this range.
    pub rows_done: u64,
}

/// Reads the layout of a job's reorganization.
///
/// # Errors
///
/// Returns an error if the read or decode fails.
pub async fn load_meta(txn: &Transaction, job: JobId) -> Result<Option<ReorgMeta>> {
    Ok(txn.get_json(keys::reorg_meta(job).as_bytes()).await?)
}

/// Returns the number of processed keys if `task` already ran to completion
/// for `job`.
///
/// # Errors
///
/// Returns an error if the read fails.
pub async fn finished_rows(txn: &Transaction, job: JobId, task: &ReorgTask) -> Result<Option<u64>> {
    Ok(load_meta(txn, job)
        .await?
        .filter(|meta| meta.task == *task && meta.finished)
        .map(|meta| meta.rows))
}

/// Deletes all reorganization state of `job`.
///
/// # Errors
///
/// Returns an error if the scan fails.
pub async fn clear(txn: &mut Transaction, job: JobId) -> Result<()> {
    let pairs = txn
        .scan_all(&KeyRange::prefix(keys::reorg_prefix(job).as_bytes()))
        .await?;
    for (key, _) in pairs {
        txn.delete(key);
    }
    Ok(())
}

/// Sampled keys kept per worker when choosing split points.
pub const SAMPLE_KEYS_PER_WORKER: usize = 64;

/// Evenly spaced keys of a scan, held in bounded memory.
///
/// Every `stride`-th offered key is kept. When the sample fills up, every
/// other kept key is dropped and the stride doubles, so the sample stays
/// spread over the whole scan.
#[derive(Debug, Clone)]
pub struct KeySample {
    capacity: usize,
    stride: u64,
    seen: u64,
    keys: Vec<Bytes>,
}

impl KeySample {
    /// Creates a sample holding at most `capacity` keys (minimum 2).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            stride: 1,
            seen: 0,
            keys: Vec::new(),
        }
    }

    /// Offers the next key of the scan, in key order.
    pub fn offer(&mut self, key: &Bytes) {
        if self.seen % self.stride == 0 {
            if self.keys.len() == self.capacity {
                let mut n = 0;
                self.keys.retain(|_| {
                    n += 1;
                    n % 2 == 1
                });
                self.stride *= 2;
            }
            if self.seen % self.stride == 0 {
                self.keys.push(key.clone());
            }
        }
        self.seen += 1;
    }

    /// Number of keys offered.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// The sampled keys, sorted.
    #[must_use]
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }
}

/// Splits `range` into at most `parts` disjoint ranges holding roughly equal
/// numbers of `keys` (sorted, all inside `range`).
#[must_use]
pub fn split_range(range: &KeyRange, keys: &[Bytes], parts: usize) -> Vec<(Bytes, Bytes)> {
    let parts = parts.min(keys.len()).max(1);
    let mut bounds = Vec::with_capacity(parts + 1);
    bounds.push(range.start.clone());
    for i in 1..parts {
        bounds.push(keys[i * keys.len() / parts].clone());
    }
    bounds.push(range.end.clone());
    bounds
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}
