//! Immutable schema snapshots.
//!
//! An [`InfoSchema`] is everything a serving node knows about the catalog at
//! one schema version. Nodes swap whole snapshots atomically; statements hold
//! an `Arc` to the snapshot they were planned with.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use keel_core::id::{SchemaId, TableId};
use keel_core::kv::{KeyRange, Transaction, TxnStore};

use super::meta::{Meta, TableHistoryEntry};
use crate::error::{Error, Result};
use crate::keys;
use crate::model::{names_eq, ColumnInfo, DatabaseInfo, IndexInfo, SchemaState, TableInfo};

/// Catalog snapshot at one schema version.
#[derive(Debug, Clone, Default)]
pub struct InfoSchema {
    version: u64,
    databases: HashMap<SchemaId, DatabaseInfo>,
    tables: HashMap<TableId, Arc<TableInfo>>,
}

impl InfoSchema {
    /// Schema version of this snapshot.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Looks up a table by ID.
    #[must_use]
    pub fn table(&self, id: TableId) -> Option<&Arc<TableInfo>> {
        self.tables.get(&id)
    }

    /// Looks up a public database by name. A database being dropped is
    /// invisible.
    #[must_use]
    pub fn database_by_name(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases
            .values()
            .find(|db| db.state == SchemaState::Public && names_eq(&db.name, name))
    }

    /// Looks up a database by ID.
    #[must_use]
    pub fn database(&self, id: SchemaId) -> Option<&DatabaseInfo> {
        self.databases.get(&id)
    }

    /// Resolves `db.table` to a table definition in any state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseNotExists`] or [`Error::TableNotExists`].
    pub fn table_by_name(&self, db: &str, table: &str) -> Result<Arc<TableInfo>> {
        let database = self
            .database_by_name(db)
            .ok_or_else(|| Error::DatabaseNotExists {
                name: db.to_string(),
            })?;
        self.tables
            .values()
            .find(|t| t.schema_id == database.id && names_eq(&t.name, table))
            .cloned()
            .ok_or_else(|| Error::TableNotExists {
                name: format!("{db}.{table}"),
            })
    }

    /// Tables of a database, in ID order.
    #[must_use]
    pub fn tables_in(&self, schema_id: SchemaId) -> Vec<Arc<TableInfo>> {
        let mut tables: Vec<_> = self
            .tables
            .values()
            .filter(|t| t.schema_id == schema_id)
            .cloned()
            .collect();
        tables.sort_by_key(|t| t.id);
        tables
    }

    /// The view exposed to the query planner: public tables with only their
    /// public columns and indexes.
    #[must_use]
    pub fn public_view(&self) -> PublicSchema {
        let mut tables: Vec<PublicTable> = self
            .tables
            .values()
            .filter(|t| t.state.is_public())
            .map(|t| PublicTable {
                id: t.id,
                schema_id: t.schema_id,
                name: t.name.clone(),
                columns: t.public_columns().cloned().collect(),
                indexes: t
                    .indexes
                    .iter()
                    .filter(|i| i.state.is_public())
                    .cloned()
                    .collect(),
            })
            .collect();
        tables.sort_by_key(|t| t.id);
        PublicSchema {
            version: self.version,
            databases: {
                let mut dbs: Vec<_> = self
                    .databases
                    .values()
                    .filter(|db| db.state == SchemaState::Public)
                    .cloned()
                    .collect();
                dbs.sort_by_key(|d| d.id);
                dbs
            },
            tables,
        }
    }
}

/// A table as the planner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicTable {
    /// Table ID.
    pub id: TableId,
    /// Owning database.
    pub schema_id: SchemaId,
    /// Table name.
    pub name: String,
    /// Public columns in display order.
    pub columns: Vec<ColumnInfo>,
    /// Public indexes.
    pub indexes: Vec<IndexInfo>,
}

impl PublicTable {
    /// Public column names in display order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// The planner's read interface at one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicSchema {
    /// Schema version.
    pub version: u64,
    /// Databases.
    pub databases: Vec<DatabaseInfo>,
    /// Public tables.
    pub tables: Vec<PublicTable>,
}

impl PublicSchema {
    /// Finds a public table by name.
    #[must_use]
    pub fn table(&self, db: &str, table: &str) -> Option<&PublicTable> {
        let db = self.databases.iter().find(|d| names_eq(&d.name, db))?;
        self.tables
            .iter()
            .find(|t| t.schema_id == db.id && names_eq(&t.name, table))
    }
}

/// Loads [`InfoSchema`] snapshots from the store.
#[derive(Clone)]
pub struct SchemaLoader {
    store: Arc<dyn TxnStore>,
}

impl std::fmt::Debug for SchemaLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaLoader").finish_non_exhaustive()
    }
}

impl SchemaLoader {
    /// Creates a loader.
    #[must_use]
    pub fn new(store: Arc<dyn TxnStore>) -> Self {
        Self { store }
    }

    /// Reads the latest published version.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn latest_version(&self) -> Result<u64> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        Meta::new(&mut txn).schema_version().await
    }

    /// Loads the full catalog at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if `version` is newer than the latest version or older
    /// than the retained history.
    pub async fn load(&self, version: u64) -> Result<InfoSchema> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let meta = Meta::new(&mut txn);
        let latest = meta.schema_version().await?;
        let floor = meta.history_floor().await?;
        if version > latest || version < floor {
            return Err(Error::internal(format!(
                "schema version {version} is not loadable (floor {floor}, latest {latest})"
            )));
        }

        let databases = meta
            .databases()
            .await?
            .into_iter()
            .map(|db| (db.id, db))
            .collect();

        let pairs = txn
            .scan_all(&KeyRange::prefix(keys::TABLE_HIST_PREFIX.as_bytes()))
            .await?;
        let mut newest: HashMap<TableId, (u64, Option<TableInfo>)> = HashMap::new();
        for (key, raw) in pairs {
            let Some((table_id, entry_version)) = keys::parse_table_history(&key) else {
                continue;
            };
            if entry_version > version {
                continue;
            }
            let entry: TableHistoryEntry = serde_json::from_slice(&raw)?;
            match newest.get(&table_id) {
                Some((seen, _)) if *seen >= entry_version => {}
                _ => {
                    newest.insert(table_id, (entry_version, entry.table));
                }
            }
        }

        let tables = newest
            .into_iter()
            .filter_map(|(id, (_, table))| table.map(|t| (id, Arc::new(t))))
            .collect();

        Ok(InfoSchema {
            version,
            databases,
            tables,
        })
    }

    /// Advances `base` to `target` by applying the diffs in between, falling
    /// back to a full load when history is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if reads fail or `target` is not loadable.
    pub async fn advance(&self, base: &InfoSchema, target: u64) -> Result<InfoSchema> {
        if target == base.version {
            return Ok(base.clone());
        }
        if target < base.version {
            return self.load(target).await;
        }

        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let meta = Meta::new(&mut txn);
        let diffs = meta.diffs_between(base.version, target).await?;
        let expected = usize::try_from(target - base.version).unwrap_or(usize::MAX);
        if diffs.len() != expected {
            drop(meta);
            return self.load(target).await;
        }

        let mut next = base.clone();
        next.version = target;
        let mut touched = BTreeSet::new();
        let mut databases_changed = false;
        for diff in &diffs {
            touched.extend(diff.table_ids.iter().copied());
            touched.extend(diff.old_table_id);
            databases_changed |= diff.database_changed;
        }
        for id in touched {
            match meta.table_at_version(id, target).await? {
                Some(table) => {
                    next.tables.insert(id, Arc::new(table));
                }
                None => {
                    next.tables.remove(&id);
                }
            }
        }
        if databases_changed {
            next.databases = meta
                .databases()
                .await?
                .into_iter()
                .map(|db| (db.id, db))
                .collect();
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use keel_core::id::JobId;
    use keel_core::kv::MemoryStore;

    use super::*;
    use crate::model::{JobType, SchemaState};
    use crate::schema::meta::{SchemaDiff, TableChange};

    fn table(id: i64, schema: SchemaId, name: &str) -> TableInfo {
        TableInfo {
            id: TableId::new(id),
            schema_id: schema,
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

    async fn setup() -> Result<(Arc<dyn TxnStore>, SchemaId)> {
        let store = MemoryStore::shared();
        let mut txn = Transaction::begin(Arc::clone(&store)).await?;
        let db = Meta::new(&mut txn).create_database("test").await?;
        txn.commit().await?;
        Ok((store, db.id))
    }

    async fn publish(store: &Arc<dyn TxnStore>, schema: SchemaId, change: TableChange) -> Result<u64> {
        let mut txn = Transaction::begin(Arc::clone(store)).await?;
        let v = Meta::new(&mut txn)
            .publish(
                SchemaDiff::for_job(JobId::new(1), JobType::CreateTable, schema),
                vec![change],
            )
            .await?;
        txn.commit().await?;
        Ok(v)
    }

    #[tokio::test]
    async fn load_returns_tables_as_of_version() -> Result<()> {
        let (store, db) = setup().await?;
        let v2 = publish(&store, db, TableChange::Upsert(table(100, db, "t"))).await?;
        publish(&store, db, TableChange::Upsert(table(100, db, "renamed"))).await?;

        let loader = SchemaLoader::new(store);
        let old = loader.load(v2).await?;
        assert_eq!(old.table_by_name("test", "t")?.id, TableId::new(100));

        let latest = loader.load(loader.latest_version().await?).await?;
        assert!(latest.table_by_name("test", "t").is_err());
        assert!(latest.table_by_name("TEST", "Renamed").is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn advance_matches_full_load() -> Result<()> {
        let (store, db) = setup().await?;
        let loader = SchemaLoader::new(Arc::clone(&store));
        let base = loader.load(loader.latest_version().await?).await?;

        publish(&store, db, TableChange::Upsert(table(100, db, "a"))).await?;
        publish(&store, db, TableChange::Upsert(table(101, db, "b"))).await?;
        let v = publish(&store, db, TableChange::Remove(TableId::new(100))).await?;

        let advanced = loader.advance(&base, v).await?;
        let full = loader.load(v).await?;
        assert_eq!(advanced.version(), v);
        assert_eq!(advanced.public_view(), full.public_view());
        assert!(advanced.table(TableId::new(100)).is_none());
        assert!(advanced.table(TableId::new(101)).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn public_view_hides_non_public_objects() -> Result<()> {
        let (store, db) = setup().await?;
        let mut hidden = table(100, db, "creating");
        hidden.state = SchemaState::WriteOnly;
        publish(&store, db, TableChange::Upsert(hidden)).await?;
        let v = publish(&store, db, TableChange::Upsert(table(101, db, "visible"))).await?;

        let view = SchemaLoader::new(store).load(v).await?.public_view();
        assert!(view.table("test", "creating").is_none());
        assert!(view.table("test", "visible").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn loading_future_versions_fails() -> Result<()> {
        let (store, _) = setup().await?;
        let loader = SchemaLoader::new(store);
        assert!(loader.load(99).await.is_err());
        Ok(())
    }
}
