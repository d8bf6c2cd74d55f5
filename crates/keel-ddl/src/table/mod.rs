//! Foreground row access honoring per-state visibility.
//!
//! A [`Table`] wraps the definition a statement was planned with and applies
//! the visibility contract of each column and index state:
//!
//! | state | reads | inserts/updates | deletes |
//! |---|---|---|---|
//! | `DeleteOnly` | hidden | skipped | entries removed |
//! | `WriteOnly`, `WriteReorganization` | hidden | maintained | entries removed |
//! | `DeleteReorganization` | hidden | skipped | entries removed |
//! | `Public` | visible | maintained | entries removed |
//!
//! Backfill builds index entries and converted cells with the same helpers,
//! so historical and live data agree.

pub mod codec;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use keel_core::id::ColumnId;
use keel_core::kv::Transaction;

use crate::error::{Error, Result};
use crate::keys;
use crate::model::{ColumnInfo, Datum, IndexInfo, TableInfo};
use codec::{RowValue, INDEX_PLACEHOLDER};

/// A row as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row handle.
    pub handle: i64,
    /// Requested column values.
    pub values: Vec<Datum>,
}

/// One index entry derived from a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Entry key.
    pub key: Bytes,
    /// Entry value.
    pub value: Bytes,
    /// The key identifies the indexed values alone (unique, no NULLs).
    pub distinct: bool,
    /// Indexed values, for error messages.
    pub values: Vec<Datum>,
}

/// Reads the value of `column` from stored cells.
#[must_use]
pub fn cell_value(column: &ColumnInfo, cells: &BTreeMap<ColumnId, Datum>) -> Datum {
    cells
        .get(&column.id)
        .cloned()
        .unwrap_or_else(|| column.missing_value())
}

/// Computes the entry `index` holds for a row.
///
/// # Errors
///
/// Returns an error if the index references a column the table lacks.
pub fn index_entry(
    table: &TableInfo,
    index: &IndexInfo,
    cells: &BTreeMap<ColumnId, Datum>,
    handle: i64,
) -> Result<IndexEntry> {
    let values = index
        .columns
        .iter()
        .map(|id| {
            table
                .column(*id)
                .map(|c| cell_value(c, cells))
                .ok_or_else(|| Error::internal(format!("index {} references missing column {id}", index.name)))
        })
        .collect::<Result<Vec<_>>>()?;
    let (key, distinct) = codec::index_key(table.id, index.id, &values, index.unique, handle);
    let value = if distinct {
        codec::unique_index_value(handle)
    } else {
        Bytes::from_static(INDEX_PLACEHOLDER)
    };
    Ok(IndexEntry {
        key,
        value,
        distinct,
        values,
    })
}

/// Rejects a primary key entry that holds NULL.
///
/// A primary index being added is writable before its columns are marked
/// NOT NULL, so both foreground writes and backfill check the entry itself.
///
/// # Errors
///
/// Returns [`Error::BadNull`] naming the first NULL column.
pub fn check_primary_not_null(table: &TableInfo, index: &IndexInfo, entry: &IndexEntry) -> Result<()> {
    if !index.primary {
        return Ok(());
    }
    match entry.values.iter().position(Datum::is_null) {
        Some(pos) => {
            let column = index
                .columns
                .get(pos)
                .and_then(|id| table.column(*id))
                .map_or_else(|| index.name.clone(), |c| c.name.clone());
            Err(Error::BadNull { column })
        }
        None => Ok(()),
    }
}

/// Renders indexed values the way duplicate-entry errors show them.
#[must_use]
pub fn entry_display(values: &[Datum]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-")
}

/// Converts the value of `from` into the hidden column replacing it.
///
/// # Errors
///
/// Returns [`Error::DataTruncated`] if the value does not fit the new type.
pub fn convert_for_changing(
    from: &ColumnInfo,
    to: &ColumnInfo,
    cells: &BTreeMap<ColumnId, Datum>,
) -> Result<Datum> {
    let value = cell_value(from, cells);
    let converted = to
        .field_type
        .convert(&value)
        .map_err(|reason| Error::DataTruncated {
            column: from.name.clone(),
            reason,
        })?;
    if to.not_null && converted.is_null() {
        return Err(Error::BadNull {
            column: from.name.clone(),
        });
    }
    Ok(converted)
}

/// Table handle used by foreground statements.
#[derive(Debug, Clone)]
pub struct Table {
    info: Arc<TableInfo>,
}

impl Table {
    /// Wraps a table definition.
    #[must_use]
    pub fn new(info: Arc<TableInfo>) -> Self {
        Self { info }
    }

    /// The wrapped definition.
    #[must_use]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    fn require_public(&self) -> Result<()> {
        if self.info.state.is_public() {
            Ok(())
        } else {
            Err(Error::TableNotExists {
                name: self.info.name.clone(),
            })
        }
    }

    fn assign(&self, cells: &mut BTreeMap<ColumnId, Datum>, values: &[(&str, Datum)]) -> Result<()> {
        for (name, value) in values {
            let column = self
                .info
                .public_column(name)
                .ok_or_else(|| Error::UnknownColumn {
                    column: (*name).to_string(),
                })?;
            if column.generated.is_some() {
                return Err(Error::InvalidRequest(format!(
                    "the value of generated column '{}' cannot be assigned",
                    column.name
                )));
            }
            let converted =
                column
                    .field_type
                    .convert(value)
                    .map_err(|reason| Error::DataTruncated {
                        column: column.name.clone(),
                        reason,
                    })?;
            if column.not_null && converted.is_null() {
                return Err(Error::BadNull {
                    column: column.name.clone(),
                });
            }
            cells.insert(column.id, converted);
        }
        Ok(())
    }

    /// Fills writable cells not assigned explicitly, then derived cells.
    fn complete_cells(
        &self,
        cells: &mut BTreeMap<ColumnId, Datum>,
        fill: impl Fn(&ColumnInfo) -> Datum,
    ) -> Result<()> {
        for column in &self.info.columns {
            if !column.state.is_writable() || column.is_hidden() || column.generated.is_some() {
                continue;
            }
            if !cells.contains_key(&column.id) {
                let value = fill(column);
                if column.state.is_public() && column.not_null && value.is_null() {
                    return Err(Error::BadNull {
                        column: column.name.clone(),
                    });
                }
                cells.insert(column.id, value);
            }
        }

        for column in &self.info.columns {
            if !column.state.is_writable() {
                continue;
            }
            if let Some(generated) = column.generated {
                let value = match self.info.column(generated.base).map(|b| cell_value(b, cells)) {
                    Some(Datum::Int(v)) => Datum::Int(v.saturating_add(generated.offset)),
                    _ => Datum::Null,
                };
                cells.insert(column.id, value);
            }
        }

        for column in &self.info.columns {
            let Some(from) = column.changing_from else {
                continue;
            };
            if !column.state.is_writable() {
                continue;
            }
            let source = self
                .info
                .column(from)
                .ok_or_else(|| Error::internal(format!("changing column {} lost its source", column.name)))?;
            let value = convert_for_changing(source, column, cells)?;
            cells.insert(column.id, value);
        }

        // Drop cells of columns that no longer accept writes.
        cells.retain(|id, _| {
            self.info
                .column(*id)
                .is_some_and(|c| c.state.is_writable())
        });
        Ok(())
    }

    async fn alloc_handle(&self, txn: &mut Transaction, cells: &BTreeMap<ColumnId, Datum>) -> Result<i64> {
        if let Some(column) = self.info.handle_column() {
            return cells
                .get(&column.id)
                .and_then(Datum::as_int)
                .ok_or_else(|| Error::BadNull {
                    column: column.name.clone(),
                });
        }
        let key = keys::auto_id(self.info.id);
        let next = txn.get_json::<i64>(key.as_bytes()).await?.unwrap_or(0) + 1;
        txn.put_json(key, &next)?;
        Ok(next)
    }

    async fn put_index_entries(
        &self,
        txn: &mut Transaction,
        cells: &BTreeMap<ColumnId, Datum>,
        handle: i64,
    ) -> Result<()> {
        for index in self.info.indexes.iter().filter(|i| i.state.is_writable()) {
            let entry = index_entry(&self.info, index, cells, handle)?;
            check_primary_not_null(&self.info, index, &entry)?;
            if entry.distinct {
                if let Some(existing) = txn.get(&entry.key).await? {
                    if codec::decode_unique_index_value(&existing)? != handle {
                        return Err(Error::DuplicateEntry {
                            index: index.name.clone(),
                            entry: entry_display(&entry.values),
                        });
                    }
                }
            }
            txn.put(entry.key, entry.value);
        }
        Ok(())
    }

    async fn delete_index_entries(
        &self,
        txn: &mut Transaction,
        cells: &BTreeMap<ColumnId, Datum>,
        handle: i64,
    ) -> Result<()> {
        for index in self.info.indexes.iter().filter(|i| i.state.is_deletable()) {
            let entry = index_entry(&self.info, index, cells, handle)?;
            if entry.distinct {
                match txn.get(&entry.key).await? {
                    Some(existing) if codec::decode_unique_index_value(&existing)? == handle => {}
                    _ => continue,
                }
            }
            txn.delete(entry.key);
        }
        Ok(())
    }

    /// Inserts a row; returns its handle.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown columns, bad values and
    /// duplicate keys, or a storage error.
    pub async fn insert(&self, txn: &mut Transaction, values: &[(&str, Datum)]) -> Result<i64> {
        self.require_public()?;
        let mut cells = BTreeMap::new();
        self.assign(&mut cells, values)?;
        self.complete_cells(&mut cells, ColumnInfo::insert_default)?;

        let handle = self.alloc_handle(txn, &cells).await?;
        let row_key = codec::record_key(self.info.id, handle);
        if txn.get(&row_key).await?.is_some() {
            return Err(Error::DuplicateEntry {
                index: crate::model::PRIMARY_KEY_NAME.to_string(),
                entry: handle.to_string(),
            });
        }
        self.put_index_entries(txn, &cells, handle).await?;
        txn.put(row_key, RowValue { cells }.encode()?);
        Ok(handle)
    }

    async fn load_cells(
        &self,
        txn: &Transaction,
        handle: i64,
    ) -> Result<Option<BTreeMap<ColumnId, Datum>>> {
        let key = codec::record_key(self.info.id, handle);
        match txn.get(&key).await? {
            Some(raw) => Ok(Some(RowValue::decode(&raw)?.cells)),
            None => Ok(None),
        }
    }

    /// Deletes a row; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delete(&self, txn: &mut Transaction, handle: i64) -> Result<bool> {
        self.require_public()?;
        let Some(cells) = self.load_cells(txn, handle).await? else {
            return Ok(false);
        };
        self.delete_index_entries(txn, &cells, handle).await?;
        txn.delete(codec::record_key(self.info.id, handle));
        Ok(true)
    }

    /// Updates a row in place; returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown columns, bad values, duplicate
    /// keys or an attempt to change the handle, or a storage error.
    pub async fn update(
        &self,
        txn: &mut Transaction,
        handle: i64,
        values: &[(&str, Datum)],
    ) -> Result<bool> {
        self.require_public()?;
        if let Some(column) = self.info.handle_column() {
            if values.iter().any(|(name, _)| crate::model::names_eq(name, &column.name)) {
                return Err(Error::InvalidRequest(format!(
                    "updating primary key column '{}' is not supported",
                    column.name
                )));
            }
        }
        let Some(old) = self.load_cells(txn, handle).await? else {
            return Ok(false);
        };

        let mut cells = old.clone();
        self.assign(&mut cells, values)?;
        self.complete_cells(&mut cells, ColumnInfo::missing_value)?;

        self.delete_index_entries(txn, &old, handle).await?;
        self.put_index_entries(txn, &cells, handle).await?;
        txn.put(
            codec::record_key(self.info.id, handle),
            RowValue { cells }.encode()?,
        );
        Ok(true)
    }

    /// Reads one row's public columns, or the named ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] for non-public columns.
    pub async fn get(&self, txn: &Transaction, handle: i64, columns: &[&str]) -> Result<Option<Row>> {
        self.require_public()?;
        let projection = self.projection(columns)?;
        Ok(self.load_cells(txn, handle).await?.map(|cells| Row {
            handle,
            values: projection.iter().map(|c| cell_value(c, &cells)).collect(),
        }))
    }

    /// Reads every row's public columns, or the named ones, in handle order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] for non-public columns, or a storage
    /// error.
    pub async fn scan(&self, txn: &Transaction, columns: &[&str]) -> Result<Vec<Row>> {
        self.require_public()?;
        let projection = self.projection(columns)?;
        let pairs = txn.scan_all(&codec::record_range(self.info.id)).await?;
        pairs
            .iter()
            .map(|(key, raw)| {
                let cells = RowValue::decode(raw)?.cells;
                Ok(Row {
                    handle: codec::decode_record_handle(key)?,
                    values: projection.iter().map(|c| cell_value(c, &cells)).collect(),
                })
            })
            .collect()
    }

    fn projection(&self, columns: &[&str]) -> Result<Vec<&ColumnInfo>> {
        if columns.is_empty() {
            return Ok(self.info.public_columns().collect());
        }
        columns
            .iter()
            .map(|name| {
                self.info
                    .public_column(name)
                    .ok_or_else(|| Error::UnknownColumn {
                        column: (*name).to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use keel_core::id::{IndexId, SchemaId, TableId};
    use keel_core::kv::{KeyRange, MemoryStore, TxnStore};

    use super::*;
    use crate::model::{FieldType, GeneratedInfo, SchemaState};

    fn column(id: i64, name: &str, ty: FieldType, state: SchemaState) -> ColumnInfo {
        ColumnInfo {
            id: ColumnId::new(id),
            name: name.to_string(),
            field_type: ty,
            not_null: false,
            default: None,
            origin_default: None,
            primary_key: false,
            generated: None,
            state,
            changing_from: None,
        }
    }

    fn base_table() -> TableInfo {
        let mut pk = column(3, "c4", FieldType::Int, SchemaState::Public);
        pk.primary_key = true;
        pk.not_null = true;
        let mut c2 = column(2, "c2", FieldType::enumeration(["N", "Y"]), SchemaState::Public);
        c2.default = Some(Datum::from("N"));
        TableInfo {
            id: TableId::new(100),
            schema_id: SchemaId::new(1),
            name: "t".into(),
            columns: vec![
                column(1, "c1", FieldType::varchar(64), SchemaState::Public),
                c2,
                pk,
            ],
            indexes: Vec::new(),
            pk_is_handle: true,
            state: SchemaState::Public,
            max_column_id: 3,
            max_index_id: 0,
            update_version: 1,
        }
    }

    async fn txn(store: &Arc<dyn TxnStore>) -> Result<Transaction> {
        Ok(Transaction::begin(Arc::clone(store)).await?)
    }

    #[tokio::test]
    async fn write_only_columns_get_defaults_but_stay_hidden() -> Result<()> {
        let store = MemoryStore::shared();
        let mut info = base_table();
        let mut c5 = column(4, "c5", FieldType::Int, SchemaState::WriteOnly);
        c5.not_null = true;
        c5.default = Some(Datum::Int(1));
        c5.origin_default = Some(Datum::Int(1));
        info.columns.push(c5);
        let table = Table::new(Arc::new(info.clone()));

        let mut t = txn(&store).await?;
        table
            .insert(&mut t, &[("c1", Datum::from("x")), ("c4", Datum::Int(9))])
            .await?;
        assert!(matches!(
            table.get(&t, 9, &["c5"]).await,
            Err(Error::UnknownColumn { .. })
        ));
        t.commit().await?;

        info.columns[3].state = SchemaState::Public;
        let public = Table::new(Arc::new(info));
        let t = txn(&store).await?;
        let row = public.get(&t, 9, &["c4", "c5", "c2"]).await?;
        assert_eq!(
            row.map(|r| r.values),
            Some(vec![Datum::Int(9), Datum::Int(1), Datum::from("N")])
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_only_indexes_are_cleaned_but_not_filled() -> Result<()> {
        let store = MemoryStore::shared();
        let mut info = base_table();
        info.indexes.push(IndexInfo {
            id: IndexId::new(1),
            name: "idx_c1".into(),
            columns: vec![ColumnId::new(1)],
            unique: false,
            primary: false,
            state: SchemaState::DeleteOnly,
        });
        let table = Table::new(Arc::new(info.clone()));
        let prefix = KeyRange::prefix(&codec::index_prefix(info.id, IndexId::new(1)));

        let mut t = txn(&store).await?;
        table
            .insert(&mut t, &[("c1", Datum::from("a")), ("c4", Datum::Int(1))])
            .await?;
        assert!(t.scan(&prefix, 10).await?.is_empty());

        info.indexes[0].state = SchemaState::WriteOnly;
        let write_only = Table::new(Arc::new(info.clone()));
        write_only
            .insert(&mut t, &[("c1", Datum::from("b")), ("c4", Datum::Int(2))])
            .await?;
        assert_eq!(t.scan(&prefix, 10).await?.len(), 1);

        info.indexes[0].state = SchemaState::DeleteOnly;
        let delete_only = Table::new(Arc::new(info));
        assert!(delete_only.delete(&mut t, 2).await?);
        assert!(t.scan(&prefix, 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unique_indexes_reject_duplicates() -> Result<()> {
        let store = MemoryStore::shared();
        let mut info = base_table();
        info.indexes.push(IndexInfo {
            id: IndexId::new(1),
            name: "uk_c1".into(),
            columns: vec![ColumnId::new(1)],
            unique: true,
            primary: false,
            state: SchemaState::Public,
        });
        let table = Table::new(Arc::new(info));
        let mut t = txn(&store).await?;
        table
            .insert(&mut t, &[("c1", Datum::from("a")), ("c4", Datum::Int(1))])
            .await?;
        let err = table
            .insert(&mut t, &[("c1", Datum::from("a")), ("c4", Datum::Int(2))])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "duplicate entry 'a' for key 'uk_c1'");

        let err = table
            .insert(&mut t, &[("c1", Datum::from("b")), ("c4", Datum::Int(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn generated_and_changing_columns_are_derived() -> Result<()> {
        let store = MemoryStore::shared();
        let mut info = base_table();
        let mut gen = column(4, "g", FieldType::BigInt, SchemaState::Public);
        gen.generated = Some(GeneratedInfo {
            base: ColumnId::new(3),
            offset: 10,
        });
        let mut changing = column(5, "_col$_c1_0", FieldType::Int, SchemaState::WriteOnly);
        changing.changing_from = Some(ColumnId::new(1));
        info.columns.push(gen);
        info.columns.push(changing);
        let table = Table::new(Arc::new(info));

        let mut t = txn(&store).await?;
        table
            .insert(&mut t, &[("c1", Datum::from("17")), ("c4", Datum::Int(5))])
            .await?;
        let row = table.get(&t, 5, &["g"]).await?;
        assert_eq!(row.map(|r| r.values), Some(vec![Datum::Int(15)]));

        let raw = t.get(&codec::record_key(TableId::new(100), 5)).await?;
        let cells = RowValue::decode(&raw.unwrap_or_default())?.cells;
        assert_eq!(cells.get(&ColumnId::new(5)), Some(&Datum::Int(17)));

        let err = table
            .insert(&mut t, &[("c1", Datum::from("abc")), ("c4", Datum::Int(6))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataTruncated { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn updates_move_index_entries() -> Result<()> {
        let store = MemoryStore::shared();
        let mut info = base_table();
        info.indexes.push(IndexInfo {
            id: IndexId::new(1),
            name: "idx_c1".into(),
            columns: vec![ColumnId::new(1)],
            unique: false,
            primary: false,
            state: SchemaState::Public,
        });
        let table = Table::new(Arc::new(info.clone()));
        let mut t = txn(&store).await?;
        table
            .insert(&mut t, &[("c1", Datum::from("a")), ("c4", Datum::Int(1))])
            .await?;
        assert!(table.update(&mut t, 1, &[("c1", Datum::from("b"))]).await?);

        let prefix = KeyRange::prefix(&codec::index_prefix(info.id, IndexId::new(1)));
        let entries = t.scan(&prefix, 10).await?;
        assert_eq!(entries.len(), 1);
        let expected = index_entry(
            &info,
            &info.indexes[0],
            &BTreeMap::from([(ColumnId::new(1), Datum::from("b"))]),
            1,
        )?;
        assert_eq!(entries[0].0, expected.key);

        assert!(!table.update(&mut t, 42, &[("c1", Datum::from("z"))]).await?);
        assert!(table.update(&mut t, 1, &[("c4", Datum::Int(3))]).await.is_err());
        Ok(())
    }
}
