//! Key layout of DDL state in the transactional store.
//!
//! ```text
//! m/schema_version                         current schema version (u64)
//! m/history_floor                          oldest loadable schema version
//! m/global_id                              ID allocator for tables and databases
//! m/db/{schema_id}                         database definitions
//! m/table/{table_id}                       latest table definition
//! m/table_hist/{table_id}/{version}        table definition as of a version
//! m/diff/{version}                         what a version changed
//! m/autoid/{table_id}                      row-handle allocator
//! ddl/job_seq                              job ID allocator; every enqueue writes it
//! ddl/queue/{job_id}                       active jobs, FIFO by ID
//! ddl/history/{job_id}                     archived jobs
//! ddl/cancel/{job_id}                      pending cancellation requests
//! ddl/reorg/{job_id}/meta                  backfill snapshot and range layout
//! ddl/reorg/{job_id}/range/{n}             per-range backfill checkpoint
//! ddl/delete_range/{job_id}/{n}            data ranges awaiting purge
//! ddl/owner                                owner lease (store-backed election)
//! lease/{node_id}                          per-node schema lease
//! ```
//!
//! Numeric components are zero-padded so lexical order is numeric order.

use keel_core::id::{JobId, NodeId, SchemaId, TableId};

/// Current schema version.
pub const SCHEMA_VERSION: &str = "m/schema_version";
/// Oldest schema version whose metadata is still retained.
pub const HISTORY_FLOOR: &str = "m/history_floor";
/// Global ID allocator.
pub const GLOBAL_ID: &str = "m/global_id";
/// Prefix of database definitions.
pub const DB_PREFIX: &str = "m/db/";
/// Prefix of latest table definitions.
pub const TABLE_PREFIX: &str = "m/table/";
/// Prefix of versioned table definitions.
pub const TABLE_HIST_PREFIX: &str = "m/table_hist/";
/// Prefix of schema diffs.
pub const DIFF_PREFIX: &str = "m/diff/";
/// Job ID allocator.
pub const JOB_SEQ: &str = "ddl/job_seq";
/// Prefix of active jobs.
pub const QUEUE_PREFIX: &str = "ddl/queue/";
/// Prefix of archived jobs.
pub const HISTORY_PREFIX: &str = "ddl/history/";
/// Prefix of cancellation requests.
pub const CANCEL_PREFIX: &str = "ddl/cancel/";
/// Prefix of pending delete ranges.
pub const DELETE_RANGE_PREFIX: &str = "ddl/delete_range/";
/// Owner lease record.
pub const OWNER: &str = "ddl/owner";
/// Prefix of node leases.
pub const LEASE_PREFIX: &str = "lease/";

/// Database definition key.
#[must_use]
pub fn database(id: SchemaId) -> String {
    format!("{DB_PREFIX}{:020}", id.get())
}

/// Latest table definition key.
#[must_use]
pub fn table(id: TableId) -> String {
    format!("{TABLE_PREFIX}{:020}", id.get())
}

/// Prefix of one table's versioned definitions.
#[must_use]
pub fn table_history_prefix(id: TableId) -> String {
    format!("{TABLE_HIST_PREFIX}{:020}/", id.get())
}

/// Versioned table definition key.
#[must_use]
pub fn table_history(id: TableId, version: u64) -> String {
    format!("{}{version:020}", table_history_prefix(id))
}

/// Parses `(table_id, version)` out of a versioned table definition key.
#[must_use]
pub fn parse_table_history(key: &[u8]) -> Option<(TableId, u64)> {
    let rest = std::str::from_utf8(key).ok()?.strip_prefix(TABLE_HIST_PREFIX)?;
    let (table, version) = rest.split_once('/')?;
    Some((TableId::new(table.parse().ok()?), version.parse().ok()?))
}

/// Schema diff key.
#[must_use]
pub fn diff(version: u64) -> String {
    format!("{DIFF_PREFIX}{version:020}")
}

/// Row-handle allocator key.
#[must_use]
pub fn auto_id(table: TableId) -> String {
    format!("m/autoid/{:020}", table.get())
}

/// Active job key.
#[must_use]
pub fn queued_job(id: JobId) -> String {
    format!("{QUEUE_PREFIX}{:020}", id.get())
}

/// Archived job key.
#[must_use]
pub fn history_job(id: JobId) -> String {
    format!("{HISTORY_PREFIX}{:020}", id.get())
}

/// Cancellation request key.
#[must_use]
pub fn cancel(id: JobId) -> String {
    format!("{CANCEL_PREFIX}{:020}", id.get())
}

/// Prefix of all backfill state for a job.
#[must_use]
pub fn reorg_prefix(id: JobId) -> String {
    format!("ddl/reorg/{:020}/", id.get())
}

/// Backfill layout key.
#[must_use]
pub fn reorg_meta(id: JobId) -> String {
    format!("{}meta", reorg_prefix(id))
}

/// Per-range backfill checkpoint key.
#[must_use]
pub fn reorg_range(id: JobId, range: usize) -> String {
    format!("{}range/{range:04}", reorg_prefix(id))
}

/// Prefix of one job's pending delete ranges.
#[must_use]
pub fn delete_range_prefix(id: JobId) -> String {
    format!("{DELETE_RANGE_PREFIX}{:020}/", id.get())
}

/// Pending delete-range key.
#[must_use]
pub fn delete_range(id: JobId, n: usize) -> String {
    format!("{}{n:04}", delete_range_prefix(id))
}

/// Node lease key.
#[must_use]
pub fn lease(node: NodeId) -> String {
    format!("{LEASE_PREFIX}{node}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keys_order_numerically() {
        let t = TableId::new(7);
        assert!(table_history(t, 9) < table_history(t, 10));
        assert!(queued_job(JobId::new(99)) < queued_job(JobId::new(100)));
    }

    #[test]
    fn history_keys_parse_back() {
        let key = table_history(TableId::new(42), 17);
        assert_eq!(
            parse_table_history(key.as_bytes()),
            Some((TableId::new(42), 17))
        );
        assert_eq!(parse_table_history(b"m/table/1"), None);
    }
}
