//! Submission-time validation.
//!
//! A request is checked against the latest committed schema, then against
//! the jobs already in flight. The rules for a table with an in-flight job:
//!
//! 1. If that job truncates, drops or renames the table, the request was
//!    planned against an identity that is going away: [`Error::SchemaChanged`]
//!    (retryable).
//! 2. Otherwise the request is validated against the latest schema, which
//!    already shows objects the in-flight job added in any state.
//! 3. If the two jobs collide on a name or column, the operation-specific
//!    error is returned (`index already exists`, `multiple primary key
//!    defined`, ...).
//! 4. Anything else is [`Error::TableBusy`].
//!
//! A request whose table is gone at the latest version but existed at its
//! planning version also gets [`Error::SchemaChanged`], as does any table
//! request in a database with a pending `DROP DATABASE`.
//!
//! [`validate`] layers `IF [NOT] EXISTS` on top: the error an existing or
//! missing object would raise turns the request into a no-op, and clauses of
//! a multi-column request that are already satisfied are pruned.

use std::collections::HashSet;

use keel_core::id::{ColumnId, IndexId, SchemaId, TableId};

use crate::error::{Error, Result};
use crate::model::{
    names_eq, ColumnDef, ColumnInfo, ColumnPosition, DatabaseInfo, FieldType, GeneratedInfo,
    IndexDef, IndexInfo, Job, JobArgs, JobRequest, JobType, NewColumn, SchemaState, TableDef,
    TableInfo, NO_TABLE, PRIMARY_KEY_NAME,
};
use crate::schema::Meta;

/// What a validated request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Existing table, or `None` for `CREATE TABLE`.
    pub table_id: Option<TableId>,
    /// Table name.
    pub table_name: String,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated {
    /// The request becomes a job with these (possibly pruned) arguments.
    Job {
        /// What the job targets.
        target: Target,
        /// Request to enqueue.
        request: JobRequest,
    },
    /// An `IF [NOT] EXISTS` clause made the request a no-op.
    Skip {
        /// What the request named.
        target: Target,
        /// The error the request would have raised.
        warning: String,
    },
}

/// Validates `request` and applies its existence flags.
///
/// # Errors
///
/// Returns the first validation or conflict error the flags do not cover.
pub async fn validate(meta: &Meta<'_>, active: &[Job], request: &JobRequest) -> Result<Validated> {
    let mut request = request.clone();
    if let Some(warning) = prune_clauses(meta, &mut request).await? {
        let target = skipped_target(meta, &request).await?;
        return Ok(Validated::Skip { target, warning });
    }
    match check_request(meta, active, &request).await {
        Ok(target) => Ok(Validated::Job { target, request }),
        Err(err) if tolerated(&request, &err) => {
            let target = skipped_target(meta, &request).await?;
            Ok(Validated::Skip {
                target,
                warning: err.to_string(),
            })
        }
        Err(err) => Err(err),
    }
}

/// Drops clauses of a multi-column request that its flags make no-ops.
/// Returns the warning if nothing is left to do.
async fn prune_clauses(meta: &Meta<'_>, request: &mut JobRequest) -> Result<Option<String>> {
    let Some(table_id) = request.table_id else {
        return Ok(None);
    };
    let Some(table) = meta.table(table_id).await? else {
        return Ok(None);
    };
    let (if_exists, if_not_exists) = (request.if_exists, request.if_not_exists);
    let mut first = None;
    match &mut request.args {
        JobArgs::AddColumns { columns } if if_not_exists => {
            columns.retain(|clause| match table.find_column(&clause.column.name) {
                Some(existing) => {
                    first.get_or_insert_with(|| Error::DuplicateColumn {
                        name: existing.name.clone(),
                    });
                    false
                }
                None => true,
            });
            if !columns.is_empty() {
                return Ok(None);
            }
        }
        JobArgs::DropColumns { names } if if_exists => {
            names.retain(|name| {
                let public = table.public_column(name).is_some();
                if !public {
                    first.get_or_insert_with(|| Error::ColumnNotExists { name: name.clone() });
                }
                public
            });
            if !names.is_empty() {
                return Ok(None);
            }
        }
        _ => return Ok(None),
    }
    Ok(first.map(|err| err.to_string()))
}

/// Returns true if the request's existence flags turn `err` into a no-op.
fn tolerated(request: &JobRequest, err: &Error) -> bool {
    match (&request.args, err) {
        (JobArgs::CreateTable { .. }, Error::TableExists { .. })
        | (
            JobArgs::AddColumn { .. } | JobArgs::AddColumns { .. },
            Error::DuplicateColumn { .. },
        )
        | (JobArgs::AddIndex { .. }, Error::IndexExists { .. }) => request.if_not_exists,
        (JobArgs::DropTable, Error::TableNotExists { .. })
        | (
            JobArgs::DropColumn { .. } | JobArgs::DropColumns { .. },
            Error::ColumnNotExists { .. },
        )
        | (JobArgs::DropIndex { .. }, Error::IndexNotExists { .. })
        | (JobArgs::DropDatabase, Error::DatabaseNotExists { .. }) => request.if_exists,
        _ => false,
    }
}

async fn skipped_target(meta: &Meta<'_>, request: &JobRequest) -> Result<Target> {
    if let JobArgs::CreateTable { table } = &request.args {
        let existing = meta
            .tables()
            .await?
            .into_iter()
            .find(|t| t.schema_id == request.schema_id && names_eq(&t.name, &table.name));
        return Ok(Target {
            table_id: existing.map(|t| t.id),
            table_name: table.name.clone(),
        });
    }
    let table = match request.table_id {
        Some(id) => meta.table(id).await?,
        None => None,
    };
    Ok(Target {
        table_id: request.table_id,
        table_name: table
            .map(|t| t.name)
            .or_else(|| request.table_name.clone())
            .unwrap_or_default(),
    })
}

/// Validates `request` against the latest schema and the in-flight `active`
/// jobs, all read through `meta`'s transaction.
///
/// # Errors
///
/// Returns the validation or conflict error the request hits first.
pub async fn check_request(meta: &Meta<'_>, active: &[Job], request: &JobRequest) -> Result<Target> {
    let db = public_database(meta, request).await?;
    let dropping = active
        .iter()
        .any(|j| j.schema_id == db.id && j.job_type == JobType::DropDatabase);

    if let JobArgs::DropDatabase = request.args {
        if dropping {
            return Err(Error::DatabaseNotExists { name: db.name });
        }
        return Ok(Target {
            table_id: Some(NO_TABLE),
            table_name: db.name,
        });
    }
    if dropping {
        return Err(Error::SchemaChanged);
    }

    if let JobArgs::CreateTable { table } = &request.args {
        check_create_table(meta, active, request.schema_id, table).await?;
        return Ok(Target {
            table_id: None,
            table_name: table.name.clone(),
        });
    }

    let table_id = request.table_id.ok_or_else(|| Error::TableNotExists {
        name: request.table_name.clone().unwrap_or_default(),
    })?;
    let busy = active
        .iter()
        .find(|j| j.table_id == table_id || j.progress.new_table_id == Some(table_id));
    if busy.is_some_and(|j| j.job_type.changes_table_identity()) {
        return Err(Error::SchemaChanged);
    }

    let Some(table) = meta.table(table_id).await? else {
        return Err(vanished(meta, table_id, request.planned_version).await);
    };
    if !table.state.is_public() {
        return Err(Error::TableNotExists {
            name: table.name.clone(),
        });
    }

    check_against_schema(meta, active, &table, &request.args).await?;

    if let Some(busy) = busy {
        return Err(conflict(busy, &request.args).unwrap_or(Error::TableBusy {
            table_id,
            job_id: busy.id,
        }));
    }

    Ok(Target {
        table_id: Some(table_id),
        table_name: table.name,
    })
}

async fn public_database(meta: &Meta<'_>, request: &JobRequest) -> Result<DatabaseInfo> {
    match meta.database(request.schema_id).await? {
        Some(db) if db.state.is_public() => Ok(db),
        Some(db) => Err(Error::DatabaseNotExists { name: db.name }),
        None => Err(Error::DatabaseNotExists {
            name: request.schema_id.to_string(),
        }),
    }
}

async fn vanished(meta: &Meta<'_>, table_id: TableId, planned_version: u64) -> Error {
    if planned_version > 0 {
        if let Ok(Some(_)) = meta.table_at_version(table_id, planned_version).await {
            return Error::SchemaChanged;
        }
    }
    Error::TableNotExists {
        name: table_id.to_string(),
    }
}

async fn check_create_table(
    meta: &Meta<'_>,
    active: &[Job],
    schema_id: SchemaId,
    def: &TableDef,
) -> Result<()> {
    name_is_free(meta, active, schema_id, &def.name).await?;
    build_table(def, TableId::new(0), schema_id).map(|_| ())
}

async fn name_is_free(meta: &Meta<'_>, active: &[Job], schema_id: SchemaId, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidRequest("table name is empty".into()));
    }
    let exists = meta
        .tables()
        .await?
        .iter()
        .any(|t| t.schema_id == schema_id && names_eq(&t.name, name));
    let pending = active.iter().any(|j| {
        j.schema_id == schema_id
            && match &j.args {
                JobArgs::CreateTable { table } => names_eq(&table.name, name),
                JobArgs::RenameTable { new_name } => names_eq(new_name, name),
                _ => false,
            }
    });
    if exists || pending {
        return Err(Error::TableExists {
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn check_against_schema(
    meta: &Meta<'_>,
    active: &[Job],
    table: &TableInfo,
    args: &JobArgs,
) -> Result<()> {
    match args {
        JobArgs::CreateTable { .. }
        | JobArgs::DropTable
        | JobArgs::TruncateTable
        | JobArgs::DropDatabase => Ok(()),
        JobArgs::RenameTable { new_name } => {
            if names_eq(new_name, &table.name) {
                return Ok(());
            }
            name_is_free(meta, active, table.schema_id, new_name).await
        }
        JobArgs::AddColumn { column, position } => check_add_column(table, column, position),
        JobArgs::DropColumn { name } => check_drop_column(table, name),
        JobArgs::AddColumns { columns } => check_add_columns(table, columns),
        JobArgs::DropColumns { names } => check_drop_columns(table, names),
        JobArgs::ModifyColumn {
            name,
            column,
            position,
        } => check_modify_column(table, name, column, position),
        JobArgs::SetDefaultValue { name, default } => {
            let col = require_public_column(table, name)?;
            if col.generated.is_some() {
                return Err(Error::InvalidRequest(format!(
                    "generated column '{name}' cannot have a default value"
                )));
            }
            if let Some(value) = default {
                checked_default(&col.name, &col.field_type, col.not_null, value)?;
            }
            Ok(())
        }
        JobArgs::AddIndex { index } => resolve_index(table, index, IndexId::new(0)).map(|_| ()),
        JobArgs::DropIndex { name } => check_drop_index(table, name),
    }
}

fn require_public_column<'a>(table: &'a TableInfo, name: &str) -> Result<&'a ColumnInfo> {
    table
        .public_column(name)
        .ok_or_else(|| Error::ColumnNotExists {
            name: name.to_string(),
        })
}

fn check_position(table: &TableInfo, position: &ColumnPosition) -> Result<()> {
    table
        .position_offset(position)
        .map(|_| ())
        .map_err(|name| Error::ColumnNotExists { name })
}

fn checked_default(
    column: &str,
    field_type: &FieldType,
    not_null: bool,
    value: &crate::model::Datum,
) -> Result<crate::model::Datum> {
    let converted = field_type
        .convert(value)
        .map_err(|reason| Error::InvalidRequest(format!("invalid default value for '{column}': {reason}")))?;
    if not_null && converted.is_null() {
        return Err(Error::InvalidRequest(format!(
            "invalid default value for '{column}': column is NOT NULL"
        )));
    }
    Ok(converted)
}

fn check_add_column(table: &TableInfo, column: &ColumnDef, position: &ColumnPosition) -> Result<()> {
    if table.find_column(&column.name).is_some() {
        return Err(Error::DuplicateColumn {
            name: column.name.clone(),
        });
    }
    if column.primary_key {
        return Err(Error::InvalidRequest(format!(
            "unsupported add column '{}' constraint PRIMARY KEY when altering table",
            column.name
        )));
    }
    if column.generated.is_some() {
        return Err(Error::InvalidRequest(
            "adding a stored generated column through ALTER TABLE is not supported".into(),
        ));
    }
    check_position(table, position)?;
    column_info(column, ColumnId::new(0), SchemaState::None).map(|_| ())
}

fn check_drop_column(table: &TableInfo, name: &str) -> Result<()> {
    let column = require_public_column(table, name)?;
    let cant = |reason: String| Error::CantDropColumn {
        column: column.name.clone(),
        reason,
    };
    if table.public_columns().count() <= 1 {
        return Err(cant("a table must have at least one column".into()));
    }
    if column.primary_key && table.pk_is_handle {
        return Err(cant("column is the primary key".into()));
    }
    if let Some(index) = table.indexes_covering(column.id).next() {
        return Err(cant(format!("column is covered by index '{}'", index.name)));
    }
    if let Some(dependent) = table.dependents_of(column.id).next() {
        return Err(cant(format!(
            "column is referenced by generated column '{}'",
            dependent.name
        )));
    }
    Ok(())
}

fn distinct_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(Error::InvalidRequest(format!(
                "column '{name}' is specified twice"
            )));
        }
    }
    Ok(())
}

fn check_add_columns(table: &TableInfo, columns: &[NewColumn]) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::InvalidRequest("no columns to add".into()));
    }
    distinct_names(columns.iter().map(|c| c.column.name.as_str()))?;
    for clause in columns {
        check_add_column(table, &clause.column, &clause.position)?;
    }
    Ok(())
}

fn check_drop_columns(table: &TableInfo, names: &[String]) -> Result<()> {
    let Some(first) = names.first() else {
        return Err(Error::InvalidRequest("no columns to drop".into()));
    };
    distinct_names(names.iter().map(String::as_str))?;
    for name in names {
        check_drop_column(table, name)?;
    }
    if table.public_columns().count() <= names.len() {
        return Err(Error::CantDropColumn {
            column: first.clone(),
            reason: "a table must have at least one column".into(),
        });
    }
    Ok(())
}

fn check_modify_column(
    table: &TableInfo,
    name: &str,
    column: &ColumnDef,
    position: &ColumnPosition,
) -> Result<()> {
    let old = require_public_column(table, name)?;
    let unsupported = |reason: String| Error::UnsupportedModifyColumn { reason };

    if !names_eq(&old.name, &column.name) && table.find_column(&column.name).is_some() {
        return Err(Error::DuplicateColumn {
            name: column.name.clone(),
        });
    }
    if column.generated.is_some() || old.generated.is_some() {
        return Err(unsupported("changing a generated column is not supported".into()));
    }
    if column.primary_key != old.primary_key {
        return Err(unsupported("can't change the primary key flag".into()));
    }
    if let ColumnPosition::After(after) = position {
        if names_eq(after, &old.name) {
            return Err(unsupported("a column cannot be positioned after itself".into()));
        }
    }
    check_position(table, position)?;
    column_info(column, old.id, SchemaState::None)?;

    if old.field_type != column.field_type && table.dependents_of(old.id).next().is_some() {
        return Err(unsupported(format!(
            "oldCol is a dependent column '{}' for generated column",
            old.name
        )));
    }
    if needs_reorg(old, column) {
        let primary = table.primary_index().is_some_and(|i| i.columns.contains(&old.id));
        if old.primary_key || primary {
            return Err(unsupported("this column has primary key flag".into()));
        }
        if let Some(index) = table.indexes_covering(old.id).next() {
            return Err(unsupported(format!(
                "column is covered by index '{}'",
                index.name
            )));
        }
    }
    Ok(())
}

/// Returns true if changing `old` to `new` rewrites stored values.
#[must_use]
pub fn needs_reorg(old: &ColumnInfo, new: &ColumnDef) -> bool {
    new.field_type.needs_reorg_from(&old.field_type) || (new.not_null && !old.not_null)
}

fn check_drop_index(table: &TableInfo, name: &str) -> Result<()> {
    if names_eq(name, PRIMARY_KEY_NAME) {
        if table.pk_is_handle {
            return Err(Error::InvalidRequest(
                "unsupported drop integer primary key".into(),
            ));
        }
        return match table.primary_index() {
            Some(index) if index.state.is_public() => Ok(()),
            _ => Err(Error::IndexNotExists {
                name: name.to_string(),
            }),
        };
    }
    match table.find_index(name) {
        Some(index) if index.state.is_public() => Ok(()),
        _ => Err(Error::IndexNotExists {
            name: name.to_string(),
        }),
    }
}

fn column_names(args: &JobArgs) -> Vec<&str> {
    match args {
        JobArgs::AddIndex { index } => index.columns.iter().map(String::as_str).collect(),
        JobArgs::ModifyColumn { name, position, .. } => {
            let mut names = vec![name.as_str()];
            if let ColumnPosition::After(after) = position {
                names.push(after);
            }
            names
        }
        JobArgs::AddColumn {
            position: ColumnPosition::After(after),
            ..
        } => vec![after.as_str()],
        JobArgs::AddColumns { columns } => columns
            .iter()
            .filter_map(|c| match &c.position {
                ColumnPosition::After(after) => Some(after.as_str()),
                _ => None,
            })
            .collect(),
        JobArgs::DropColumn { name } | JobArgs::SetDefaultValue { name, .. } => vec![name.as_str()],
        JobArgs::DropColumns { names } => names.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Column names a job brings into existence.
fn added_names(args: &JobArgs) -> Vec<&str> {
    match args {
        JobArgs::AddColumn { column, .. } => vec![column.name.as_str()],
        JobArgs::AddColumns { columns } => columns.iter().map(|c| c.column.name.as_str()).collect(),
        JobArgs::ModifyColumn { name, column, .. } if !names_eq(name, &column.name) => {
            vec![column.name.as_str()]
        }
        _ => Vec::new(),
    }
}

fn dropped_names(args: &JobArgs) -> Vec<&str> {
    match args {
        JobArgs::DropColumn { name } => vec![name.as_str()],
        JobArgs::DropColumns { names } => names.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

fn overlap(ours: &[&str], theirs: &[&str]) -> Option<String> {
    ours.iter()
        .find(|n| theirs.iter().any(|t| names_eq(n, t)))
        .map(|n| (*n).to_string())
}

/// The operation-specific error for `request` colliding with `busy`, if any.
#[must_use]
pub fn conflict(busy: &Job, request: &JobArgs) -> Option<Error> {
    match (&busy.args, request) {
        (JobArgs::AddIndex { index: a }, JobArgs::AddIndex { index: b }) if a.primary && b.primary => {
            Some(Error::MultiplePrimaryKey)
        }
        (JobArgs::AddIndex { index: a }, JobArgs::AddIndex { index: b })
            if names_eq(&a.name, &b.name) =>
        {
            Some(Error::IndexExists {
                name: b.name.clone(),
            })
        }
        (JobArgs::DropColumn { .. } | JobArgs::DropColumns { .. }, other) => {
            overlap(&column_names(other), &dropped_names(&busy.args))
                .map(|name| Error::ColumnNotExists { name })
        }
        (JobArgs::DropIndex { name: a }, JobArgs::DropIndex { name: b }) if names_eq(a, b) => {
            Some(Error::IndexNotExists { name: b.clone() })
        }
        (JobArgs::ModifyColumn { name: a, .. }, JobArgs::ModifyColumn { name: b, .. })
            if names_eq(a, b) =>
        {
            Some(Error::UnsupportedModifyColumn {
                reason: format!("column '{b}' is being modified by job {}", busy.id),
            })
        }
        (ongoing, other) => overlap(&added_names(other), &added_names(ongoing))
            .map(|name| Error::DuplicateColumn { name }),
    }
}

/// Builds a column definition from a request, with no generated expression.
///
/// # Errors
///
/// Returns an error if the default does not fit the type.
pub fn column_info(def: &ColumnDef, id: ColumnId, state: SchemaState) -> Result<ColumnInfo> {
    if def.name.trim().is_empty() {
        return Err(Error::InvalidRequest("column name is empty".into()));
    }
    let default = def
        .default
        .as_ref()
        .map(|v| checked_default(&def.name, &def.field_type, def.not_null, v))
        .transpose()?;
    Ok(ColumnInfo {
        id,
        name: def.name.clone(),
        field_type: def.field_type.clone(),
        not_null: def.not_null,
        default,
        origin_default: None,
        primary_key: def.primary_key,
        generated: None,
        state,
        changing_from: None,
    })
}

/// Resolves an index definition against `table`.
///
/// # Errors
///
/// Returns `IndexExists`, `MultiplePrimaryKey` or `ColumnNotExists`.
pub fn resolve_index(table: &TableInfo, def: &IndexDef, id: IndexId) -> Result<IndexInfo> {
    if def.primary {
        if table.has_primary_key() {
            return Err(Error::MultiplePrimaryKey);
        }
    } else if def.name.trim().is_empty() || names_eq(&def.name, PRIMARY_KEY_NAME) {
        return Err(Error::InvalidRequest(format!(
            "incorrect index name '{}'",
            def.name
        )));
    }
    if table.find_index(&def.name).is_some() {
        return Err(Error::IndexExists {
            name: def.name.clone(),
        });
    }
    if def.columns.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "index '{}' covers no columns",
            def.name
        )));
    }
    let mut seen = HashSet::new();
    let columns = def
        .columns
        .iter()
        .map(|name| {
            let column = require_public_column(table, name)?;
            if !seen.insert(column.id) {
                return Err(Error::DuplicateColumn { name: name.clone() });
            }
            Ok(column.id)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(IndexInfo {
        id,
        name: if def.primary {
            PRIMARY_KEY_NAME.to_string()
        } else {
            def.name.clone()
        },
        columns,
        unique: def.unique || def.primary,
        primary: def.primary,
        state: SchemaState::None,
    })
}

/// Builds the definition of a new table.
///
/// # Errors
///
/// Returns the first validation error in `def`.
pub fn build_table(def: &TableDef, id: TableId, schema_id: SchemaId) -> Result<TableInfo> {
    if def.columns.is_empty() {
        return Err(Error::InvalidRequest(
            "a table must have at least one column".into(),
        ));
    }
    let mut table = TableInfo {
        id,
        schema_id,
        name: def.name.clone(),
        columns: Vec::with_capacity(def.columns.len()),
        indexes: Vec::new(),
        pk_is_handle: false,
        state: SchemaState::Public,
        max_column_id: 0,
        max_index_id: 0,
        update_version: 0,
    };

    for column in &def.columns {
        if table.find_column(&column.name).is_some() {
            return Err(Error::DuplicateColumn {
                name: column.name.clone(),
            });
        }
        if column.primary_key && table.columns.iter().any(|c| c.primary_key) {
            return Err(Error::MultiplePrimaryKey);
        }
        let id = table.alloc_column_id();
        table.columns.push(column_info(column, id, SchemaState::Public)?);
    }

    for (info, column) in def.columns.iter().enumerate() {
        let Some(generated) = &column.generated else {
            continue;
        };
        let base = table
            .find_column(&generated.base)
            .ok_or_else(|| Error::ColumnNotExists {
                name: generated.base.clone(),
            })?;
        let base_is_generated = def
            .columns
            .iter()
            .any(|c| names_eq(&c.name, &base.name) && c.generated.is_some());
        if base_is_generated {
            return Err(Error::InvalidRequest(format!(
                "generated column '{}' cannot refer to another generated column",
                column.name
            )));
        }
        if !base.field_type.is_integer() || !column.field_type.is_integer() {
            return Err(Error::InvalidRequest(format!(
                "generated column '{}' must be an integer over an integer column",
                column.name
            )));
        }
        let base_id = base.id;
        table.columns[info].generated = Some(GeneratedInfo {
            base: base_id,
            offset: generated.offset,
        });
    }

    if let Some(pk) = table.columns.iter().find(|c| c.primary_key) {
        if pk.field_type.is_integer() && pk.generated.is_none() {
            table.pk_is_handle = true;
        } else {
            let def = IndexDef::primary([pk.name.clone()]);
            let id = table.alloc_index_id();
            let mut index = resolve_index(&table, &def, id)?;
            index.state = SchemaState::Public;
            table.indexes.push(index);
        }
    }

    for index in &def.indexes {
        let id = table.alloc_index_id();
        let mut info = resolve_index(&table, index, id)?;
        info.state = SchemaState::Public;
        table.indexes.push(info);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use keel_core::id::JobId;

    use super::*;
    use crate::model::{Datum, JobState};

    fn scenario_table() -> TableInfo {
        let def = TableDef {
            name: "t".into(),
            columns: vec![
                ColumnDef::new("c1", FieldType::varchar(64)),
                ColumnDef::new("c2", FieldType::enumeration(["N", "Y"])).default_value("N"),
                ColumnDef::new("c4", FieldType::Int).primary_key(),
                ColumnDef::new("b", FieldType::Int),
                ColumnDef::new("g", FieldType::BigInt).generated("b", 1),
            ],
            indexes: vec![IndexDef::new("idx_c1", ["c1"])],
        };
        build_table(&def, TableId::new(10), SchemaId::new(1)).unwrap()
    }

    fn busy_with(args: JobArgs) -> Job {
        let mut job = Job::from_request(
            JobId::new(7),
            TableId::new(10),
            "t",
            JobRequest::new(SchemaId::new(1), TableId::new(10), args),
        );
        job.state = JobState::Running;
        job
    }

    #[test]
    fn build_table_resolves_ids_and_handle() {
        let table = scenario_table();
        assert!(table.pk_is_handle);
        assert_eq!(table.handle_column().map(|c| c.name.as_str()), Some("c4"));
        let g = table.find_column("g").unwrap();
        assert_eq!(
            g.generated,
            Some(GeneratedInfo {
                base: ColumnId::new(4),
                offset: 1
            })
        );
        assert_eq!(table.indexes[0].columns, vec![ColumnId::new(1)]);
        assert_eq!(table.max_column_id, 5);
    }

    #[test]
    fn non_integer_primary_keys_become_indexes() {
        let def = TableDef {
            name: "s".into(),
            columns: vec![ColumnDef::new("k", FieldType::varchar(8)).primary_key()],
            indexes: Vec::new(),
        };
        let table = build_table(&def, TableId::new(1), SchemaId::new(1)).unwrap();
        assert!(!table.pk_is_handle);
        assert!(table.primary_index().is_some_and(|i| i.unique));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let def = TableDef {
            name: "d".into(),
            columns: vec![
                ColumnDef::new("a", FieldType::Int).primary_key(),
                ColumnDef::new("b", FieldType::Int).primary_key(),
            ],
            indexes: Vec::new(),
        };
        assert!(matches!(
            build_table(&def, TableId::new(1), SchemaId::new(1)),
            Err(Error::MultiplePrimaryKey)
        ));
    }

    #[test]
    fn modify_rejects_generated_dependencies() {
        let table = scenario_table();
        let err = check_modify_column(
            &table,
            "b",
            &ColumnDef::new("b", FieldType::varchar(10)),
            &ColumnPosition::Default,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported modify column: oldCol is a dependent column 'b' for generated column"
        );

        let err = check_modify_column(
            &table,
            "c4",
            &ColumnDef::new("c4", FieldType::TinyInt).primary_key(),
            &ColumnPosition::Default,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported modify column: this column has primary key flag"
        );
    }

    #[test]
    fn drop_column_rules() {
        let table = scenario_table();
        assert!(matches!(
            check_drop_column(&table, "c4"),
            Err(Error::CantDropColumn { .. })
        ));
        assert!(matches!(
            check_drop_column(&table, "c1"),
            Err(Error::CantDropColumn { .. })
        ));
        assert!(matches!(
            check_drop_column(&table, "b"),
            Err(Error::CantDropColumn { .. })
        ));
        assert!(check_drop_column(&table, "c2").is_ok());
        assert!(matches!(
            check_drop_column(&table, "nope"),
            Err(Error::ColumnNotExists { .. })
        ));
    }

    #[test]
    fn add_column_rules() {
        let table = scenario_table();
        assert!(matches!(
            check_add_column(&table, &ColumnDef::new("C1", FieldType::Int), &ColumnPosition::Default),
            Err(Error::DuplicateColumn { .. })
        ));
        assert!(matches!(
            check_add_column(
                &table,
                &ColumnDef::new("c9", FieldType::Int),
                &ColumnPosition::After("zz".into())
            ),
            Err(Error::ColumnNotExists { .. })
        ));
        assert!(check_add_column(
            &table,
            &ColumnDef::new("c5", FieldType::Int).not_null().default_value(1_i64),
            &ColumnPosition::Default
        )
        .is_ok());
        assert!(check_add_column(
            &table,
            &ColumnDef::new("c6", FieldType::TinyInt).default_value(Datum::Int(999)),
            &ColumnPosition::Default
        )
        .is_err());
    }

    #[test]
    fn same_name_index_jobs_conflict_specifically() {
        let busy = busy_with(JobArgs::AddIndex {
            index: IndexDef::new("idx_b", ["b"]),
        });
        let err = conflict(
            &busy,
            &JobArgs::AddIndex {
                index: IndexDef::new("idx_b", ["c1"]),
            },
        );
        assert_eq!(
            err.map(|e| e.to_string()),
            Some("index already exists: idx_b".to_string())
        );
        assert!(conflict(&busy, &JobArgs::DropColumn { name: "c2".into() }).is_none());
    }

    #[test]
    fn double_primary_keys_conflict() {
        let busy = busy_with(JobArgs::AddIndex {
            index: IndexDef::primary(["b"]),
        });
        let err = conflict(
            &busy,
            &JobArgs::AddIndex {
                index: IndexDef::primary(["c1"]),
            },
        );
        assert!(matches!(err, Some(Error::MultiplePrimaryKey)));
    }

    #[test]
    fn dropped_columns_cannot_be_referenced() {
        let busy = busy_with(JobArgs::DropColumn { name: "c2".into() });
        let err = conflict(
            &busy,
            &JobArgs::AddIndex {
                index: IndexDef::new("i", ["C2"]),
            },
        );
        assert!(matches!(err, Some(Error::ColumnNotExists { .. })));
    }

    #[test]
    fn existence_flags_tolerate_only_their_own_errors() {
        let drop = JobRequest::new(SchemaId::new(1), TableId::new(10), JobArgs::DropIndex {
            name: "i".into(),
        });
        let missing = Error::IndexNotExists { name: "i".into() };
        assert!(!tolerated(&drop, &missing));
        assert!(tolerated(&drop.clone().if_exists(), &missing));
        assert!(!tolerated(&drop.clone().if_not_exists(), &missing));
        assert!(!tolerated(&drop.if_exists(), &Error::SchemaChanged));

        let add = JobRequest::new(
            SchemaId::new(1),
            TableId::new(10),
            JobArgs::AddColumns {
                columns: vec![NewColumn::new(ColumnDef::new("c1", FieldType::Int))],
            },
        )
        .if_not_exists();
        assert!(tolerated(&add, &Error::DuplicateColumn { name: "c1".into() }));
        assert!(!tolerated(&add, &Error::ColumnNotExists { name: "c1".into() }));
    }

    #[test]
    fn multi_column_adds_check_every_clause() {
        let table = scenario_table();
        let err = check_add_columns(
            &table,
            &[
                NewColumn::new(ColumnDef::new("x", FieldType::Int)),
                NewColumn::new(ColumnDef::new("X", FieldType::Int)),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid DDL request: column 'X' is specified twice"
        );
        assert!(matches!(
            check_add_columns(
                &table,
                &[
                    NewColumn::new(ColumnDef::new("x", FieldType::Int)),
                    NewColumn::new(ColumnDef::new("y", FieldType::Int)).at(ColumnPosition::After("x".into())),
                ],
            ),
            Err(Error::ColumnNotExists { .. })
        ));
        assert!(matches!(check_add_columns(&table, &[]), Err(Error::InvalidRequest(_))));
        assert!(check_add_columns(
            &table,
            &[
                NewColumn::new(ColumnDef::new("x", FieldType::Int)),
                NewColumn::new(ColumnDef::new("y", FieldType::Int)).at(ColumnPosition::First),
            ],
        )
        .is_ok());
    }

    #[test]
    fn multi_column_drops_keep_a_column() {
        let def = TableDef {
            name: "p".into(),
            columns: vec![
                ColumnDef::new("x", FieldType::Int),
                ColumnDef::new("y", FieldType::Int),
            ],
            indexes: Vec::new(),
        };
        let table = build_table(&def, TableId::new(2), SchemaId::new(1)).unwrap();
        let err = check_drop_columns(&table, &["x".into(), "y".into()]).unwrap_err();
        assert!(matches!(err, Error::CantDropColumn { ref column, .. } if column == "x"));
        assert!(check_drop_columns(&table, &["y".into()]).is_ok());
        assert!(matches!(
            check_drop_columns(&table, &["y".into(), "Y".into()]),
            Err(Error::InvalidRequest(_))
        ));

        let table = scenario_table();
        assert!(matches!(
            check_drop_columns(&table, &["c2".into(), "c4".into()]),
            Err(Error::CantDropColumn { ref column, .. }) if column == "c4"
        ));
    }

    #[test]
    fn multi_column_jobs_conflict_on_shared_names() {
        let busy = busy_with(JobArgs::DropColumns {
            names: vec!["c2".into(), "b".into()],
        });
        assert!(matches!(
            conflict(&busy, &JobArgs::DropColumn { name: "B".into() }),
            Some(Error::ColumnNotExists { ref name }) if name == "B"
        ));
        assert!(conflict(&busy, &JobArgs::DropColumn { name: "c1".into() }).is_none());

        let busy = busy_with(JobArgs::AddColumns {
            columns: vec![
                NewColumn::new(ColumnDef::new("x", FieldType::Int)),
                NewColumn::new(ColumnDef::new("y", FieldType::Int)),
            ],
        });
        let err = conflict(
            &busy,
            &JobArgs::AddColumn {
                column: ColumnDef::new("y", FieldType::Int),
                position: ColumnPosition::Default,
            },
        );
        assert!(matches!(err, Some(Error::DuplicateColumn { ref name }) if name == "y"));
        assert!(conflict(
            &busy,
            &JobArgs::AddColumns {
                columns: vec![NewColumn::new(ColumnDef::new("z", FieldType::Int))],
            },
        )
        .is_none());
    }
}
