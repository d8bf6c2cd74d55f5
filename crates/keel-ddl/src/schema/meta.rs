//! Transactional access to versioned schema metadata.
//!
//! Every schema change goes through [`Meta::publish`], which bumps the version
//! counter, records the new table definitions under that version and writes a
//! [`SchemaDiff`], all inside the caller's transaction. The DDL owner commits
//! that transaction together with the job's new schema state, so a version is
//! published if and only if the job step that produced it is.

use std::collections::BTreeMap;

use keel_core::id::{JobId, SchemaId, TableId};
use keel_core::kv::{KeyRange, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys;
use crate::model::{names_eq, DatabaseInfo, JobType, SchemaState, TableInfo};

/// One table-level change in a published version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableChange {
    /// The table exists with this definition.
    Upsert(TableInfo),
    /// The table no longer exists.
    Remove(TableId),
}

/// What a schema version changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Version this diff produced.
    pub version: u64,
    /// Job that published it, if any.
    pub job_id: Option<JobId>,
    /// Type of that job.
    pub job_type: Option<JobType>,
    /// Database affected.
    pub schema_id: SchemaId,
    /// Tables whose definition changed.
    pub table_ids: Vec<TableId>,
    /// Previous ID of a table that got a new identity.
    pub old_table_id: Option<TableId>,
    /// Statements planned against an older identity of these tables must
    /// be re-planned.
    pub identity_changed: bool,
    /// The set of databases changed.
    #[serde(default)]
    pub database_changed: bool,
}

impl SchemaDiff {
    /// Creates a diff for a job step; the version is filled in on publish.
    #[must_use]
    pub fn for_job(job_id: JobId, job_type: JobType, schema_id: SchemaId) -> Self {
        Self {
            version: 0,
            job_id: Some(job_id),
            job_type: Some(job_type),
            schema_id,
            table_ids: Vec::new(),
            old_table_id: None,
            identity_changed: false,
            database_changed: false,
        }
    }

    /// Returns true if this diff invalidates statements touching `table`.
    #[must_use]
    pub fn invalidates(&self, table: TableId) -> bool {
        self.identity_changed
            && (self.table_ids.contains(&table) || self.old_table_id == Some(table))
    }
}

/// A table definition as of one version; `None` records a removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHistoryEntry {
    /// Version that produced this entry.
    pub version: u64,
    /// Definition, absent if the table was removed.
    pub table: Option<TableInfo>,
}

/// Metadata accessor bound to one transaction.
#[derive(Debug)]
pub struct Meta<'a> {
    txn: &'a mut Transaction,
}

impl<'a> Meta<'a> {
    /// Wraps a transaction.
    pub fn new(txn: &'a mut Transaction) -> Self {
        Self { txn }
    }

    /// Returns the underlying transaction.
    pub fn txn(&mut self) -> &mut Transaction {
        &mut *self.txn
    }

    /// Reads the current schema version (0 before bootstrap).
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn schema_version(&self) -> Result<u64> {
        Ok(self
            .txn
            .get_json::<u64>(keys::SCHEMA_VERSION.as_bytes())
            .await?
            .unwrap_or(0))
    }

    /// Allocates `n` IDs from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or encode fails.
    pub async fn alloc_global_ids(&mut self, n: usize) -> Result<Vec<i64>> {
        let current = self
            .txn
            .get_json::<i64>(keys::GLOBAL_ID.as_bytes())
            .await?
            .unwrap_or(0);
        let count = i64::try_from(n).map_err(|_| Error::internal("too many IDs requested"))?;
        self.txn.put_json(keys::GLOBAL_ID, &(current + count))?;
        Ok((current + 1..=current + count).collect())
    }

    /// Reads a database definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn database(&self, id: SchemaId) -> Result<Option<DatabaseInfo>> {
        Ok(self.txn.get_json(keys::database(id).as_bytes()).await?)
    }

    /// Lists all databases.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        let pairs = self
            .txn
            .scan_all(&KeyRange::prefix(keys::DB_PREFIX.as_bytes()))
            .await?;
        pairs
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Error::from))
            .collect()
    }

    /// Creates a database and publishes a version for it.
    ///
    /// # Errors
    ///
    /// Returns an error if a database with the name exists or the write fails.
    pub async fn create_database(&mut self, name: &str) -> Result<DatabaseInfo> {
        if self
            .databases()
            .await?
            .iter()
            .any(|db| names_eq(&db.name, name))
        {
            return Err(Error::InvalidRequest(format!(
                "database '{name}' already exists"
            )));
        }
        let id = self
            .alloc_global_ids(1)
            .await?
            .first()
            .copied()
            .ok_or_else(|| Error::internal("no database ID allocated"))?;
        let db = DatabaseInfo {
            id: SchemaId::new(id),
            name: name.to_string(),
            state: SchemaState::Public,
        };
        self.txn.put_json(keys::database(db.id), &db)?;
        let diff = SchemaDiff {
            version: 0,
            job_id: None,
            job_type: None,
            schema_id: db.id,
            table_ids: Vec::new(),
            old_table_id: None,
            identity_changed: false,
            database_changed: true,
        };
        self.publish(diff, Vec::new()).await?;
        Ok(db)
    }

    /// Writes a database definition. The caller publishes the version that
    /// carries it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn put_database(&mut self, db: &DatabaseInfo) -> Result<()> {
        self.txn.put_json(keys::database(db.id), db)?;
        Ok(())
    }

    /// Deletes a database definition.
    pub fn remove_database(&mut self, id: SchemaId) {
        self.txn.delete(keys::database(id));
    }

    /// Reads the latest definition of a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn table(&self, id: TableId) -> Result<Option<TableInfo>> {
        Ok(self.txn.get_json(keys::table(id).as_bytes()).await?)
    }

    /// Reads the latest definition of a table that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotExists`] if it is gone.
    pub async fn require_table(&self, id: TableId) -> Result<TableInfo> {
        self.table(id).await?.ok_or_else(|| Error::TableNotExists {
            name: format!("#{id}"),
        })
    }

    /// Lists the latest definition of every table.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn tables(&self) -> Result<Vec<TableInfo>> {
        let pairs = self
            .txn
            .scan_all(&KeyRange::prefix(keys::TABLE_PREFIX.as_bytes()))
            .await?;
        pairs
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Error::from))
            .collect()
    }

    /// Reads a table's definition as of `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn table_at_version(&self, id: TableId, version: u64) -> Result<Option<TableInfo>> {
        let range = KeyRange::new(
            keys::table_history_prefix(id).into_bytes(),
            keys::table_history(id, version.saturating_add(1)).into_bytes(),
        );
        let pairs = self.txn.scan_all(&range).await?;
        match pairs.last() {
            Some((_, raw)) => Ok(serde_json::from_slice::<TableHistoryEntry>(raw)?.table),
            None => Ok(None),
        }
    }

    /// Publishes a new schema version.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns an error if a read or encode fails.
    pub async fn publish(&mut self, mut diff: SchemaDiff, changes: Vec<TableChange>) -> Result<u64> {
        let version = self.schema_version().await? + 1;
        self.txn.put_json(keys::SCHEMA_VERSION, &version)?;

        for change in changes {
            match change {
                TableChange::Upsert(mut table) => {
                    table.update_version = version;
                    if !diff.table_ids.contains(&table.id) {
                        diff.table_ids.push(table.id);
                    }
                    self.txn.put_json(keys::table(table.id), &table)?;
                    let id = table.id;
                    self.txn.put_json(
                        keys::table_history(id, version),
                        &TableHistoryEntry {
                            version,
                            table: Some(table),
                        },
                    )?;
                }
                TableChange::Remove(id) => {
                    if !diff.table_ids.contains(&id) {
                        diff.table_ids.push(id);
                    }
                    self.txn.delete(keys::table(id));
                    self.txn.put_json(
                        keys::table_history(id, version),
                        &TableHistoryEntry {
                            version,
                            table: None,
                        },
                    )?;
                }
            }
        }

        diff.version = version;
        self.txn.put_json(keys::diff(version), &diff)?;
        Ok(version)
    }

    /// Reads the diffs of versions in `(from, to]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn diffs_between(&self, from: u64, to: u64) -> Result<Vec<SchemaDiff>> {
        if to <= from {
            return Ok(Vec::new());
        }
        let range = KeyRange::new(
            keys::diff(from + 1).into_bytes(),
            keys::diff(to + 1).into_bytes(),
        );
        let pairs = self.txn.scan_all(&range).await?;
        pairs
            .iter()
            .map(|(_, raw)| serde_json::from_slice(raw).map_err(Error::from))
            .collect()
    }

    /// Oldest version whose metadata is retained.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn history_floor(&self) -> Result<u64> {
        Ok(self
            .txn
            .get_json::<u64>(keys::HISTORY_FLOOR.as_bytes())
            .await?
            .unwrap_or(0))
    }

    /// Drops metadata history that no version at or above `keep_from` needs.
    ///
    /// For each table the newest entry at or below `keep_from` is kept, unless
    /// it records a removal. Returns the number of deleted entries.
    ///
    /// # Errors
    ///
    /// Returns an error if a scan or decode fails.
    pub async fn prune_history(&mut self, keep_from: u64) -> Result<usize> {
        let floor = self.history_floor().await?;
        if keep_from <= floor {
            return Ok(0);
        }

        let pairs = self
            .txn
            .scan_all(&KeyRange::prefix(keys::TABLE_HIST_PREFIX.as_bytes()))
            .await?;
        let mut by_table: BTreeMap<TableId, Vec<(u64, bool)>> = BTreeMap::new();
        for (key, raw) in &pairs {
            let Some((table, version)) = keys::parse_table_history(key) else {
                continue;
            };
            if version > keep_from {
                continue;
            }
            let entry: TableHistoryEntry = serde_json::from_slice(raw)?;
            by_table
                .entry(table)
                .or_default()
                .push((version, entry.table.is_some()));
        }

        let mut deleted = 0;
        for (table, entries) in by_table {
            let Some(&(newest, exists)) = entries.last() else {
                continue;
            };
            for &(version, _) in &entries {
                if version < newest || !exists {
                    self.txn.delete(keys::table_history(table, version));
                    deleted += 1;
                }
            }
        }

        for diff in self.diffs_between(floor, keep_from.saturating_sub(1)).await? {
            self.txn.delete(keys::diff(diff.version));
            deleted += 1;
        }
        self.txn.put_json(keys::HISTORY_FLOOR, &keep_from)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_core::kv::{MemoryStore, TxnStore};

    use super::*;

    fn table(id: i64, name: &str) -> TableInfo {
        TableInfo {
            id: TableId::new(id),
            schema_id: SchemaId::new(1),
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
            pk_is_handle: false,
            state: SchemaState::Public,
            max_column_id: 0,
            max_index_id: 0,
            update_version: 0,
        }
    }

    async fn publish(
        store: &Arc<dyn TxnStore>,
        changes: Vec<TableChange>,
    ) -> Result<u64> {
        let mut txn = Transaction::begin(Arc::clone(store)).await?;
        let version = Meta::new(&mut txn)
            .publish(
                SchemaDiff::for_job(JobId::new(1), JobType::CreateTable, SchemaId::new(1)),
                changes,
            )
            .await?;
        txn.commit().await?;
        Ok(version)
    }

    #[tokio::test]
    async fn publish_bumps_version_and_records_history() -> Result<()> {
        let store = MemoryStore::shared();
        let v1 = publish(&store, vec![TableChange::Upsert(table(5, "t"))]).await?;
        let v2 = publish(&store, vec![TableChange::Upsert(table(5, "t2"))]).await?;
        assert_eq!((v1, v2), (1, 2));

        let mut txn = Transaction::begin(Arc::clone(&store)).await?;
        let meta = Meta::new(&mut txn);
        assert_eq!(meta.schema_version().await?, 2);
        let old = meta.table_at_version(TableId::new(5), 1).await?;
        assert_eq!(old.map(|t| t.name), Some("t".to_string()));
        let latest = meta.require_table(TableId::new(5)).await?;
        assert_eq!(latest.name, "t2");
        assert_eq!(latest.update_version, 2);

        let diffs = meta.diffs_between(0, 2).await?;
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[1].table_ids, vec![TableId::new(5)]);
        Ok(())
    }

    #[tokio::test]
    async fn removed_tables_vanish_from_later_versions() -> Result<()> {
        let store = MemoryStore::shared();
        publish(&store, vec![TableChange::Upsert(table(5, "t"))]).await?;
        publish(&store, vec![TableChange::Remove(TableId::new(5))]).await?;

        let mut txn = Transaction::begin(store).await?;
        let meta = Meta::new(&mut txn);
        assert!(meta.table(TableId::new(5)).await?.is_none());
        assert!(meta.table_at_version(TableId::new(5), 2).await?.is_none());
        assert!(meta.table_at_version(TableId::new(5), 1).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn pruning_keeps_the_entry_needed_at_the_floor() -> Result<()> {
        let store = MemoryStore::shared();
        publish(&store, vec![TableChange::Upsert(table(5, "a"))]).await?;
        publish(&store, vec![TableChange::Upsert(table(5, "b"))]).await?;
        publish(&store, vec![TableChange::Upsert(table(6, "x"))]).await?;
        publish(&store, vec![TableChange::Upsert(table(5, "c"))]).await?;

        let mut txn = Transaction::begin(Arc::clone(&store)).await?;
        let deleted = Meta::new(&mut txn).prune_history(3).await?;
        txn.commit().await?;
        assert!(deleted >= 1);

        let mut txn = Transaction::begin(store).await?;
        let meta = Meta::new(&mut txn);
        assert_eq!(meta.history_floor().await?, 3);
        let at_floor = meta.table_at_version(TableId::new(5), 3).await?;
        assert_eq!(at_floor.map(|t| t.name), Some("b".to_string()));
        assert!(meta.table_at_version(TableId::new(5), 1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn global_ids_are_unique_and_increasing() -> Result<()> {
        let store = MemoryStore::shared();
        let mut txn = Transaction::begin(store).await?;
        let mut meta = Meta::new(&mut txn);
        let first = meta.alloc_global_ids(2).await?;
        let second = meta.alloc_global_ids(1).await?;
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);
        Ok(())
    }
}
