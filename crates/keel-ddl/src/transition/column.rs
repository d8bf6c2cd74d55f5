//! Column operations.
//!
//! A retyping `MODIFY COLUMN` adds a hidden column (`_col$_{name}_{id}`) that
//! walks the add path while writes keep it in sync with the original. Backfill
//! fills it for historical rows; at public the hidden column takes over the
//! original's name and position and the original is removed in the same
//! version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_core::id::ColumnId;
use tracing::info;

use super::{rollback_drop, rollback_nothing, unexpected_state, StepContext, StepOutcome, Transition};
use crate::error::{Error, Result};
use crate::model::{
    ColumnDef, ColumnInfo, ColumnPosition, Job, JobArgs, NewColumn, SchemaState, TableInfo,
};
use crate::reorg::ReorgTask;
use crate::table::convert_for_changing;
use crate::validate::{column_info, needs_reorg};

fn tracked_column(job: &Job) -> Result<ColumnId> {
    job.progress
        .column_id
        .ok_or_else(|| Error::internal(format!("job {} lost its column", job.id)))
}

fn column_in<'a>(table: &'a mut TableInfo, id: ColumnId) -> Result<&'a mut ColumnInfo> {
    let name = table.name.clone();
    table
        .column_mut(id)
        .ok_or_else(|| Error::internal(format!("column {id} vanished from table {name}")))
}

fn insert_at(table: &mut TableInfo, column: ColumnInfo, position: &ColumnPosition) -> Result<()> {
    let offset = table
        .position_offset(position)
        .map_err(|name| Error::ColumnNotExists { name })?;
    table.columns.insert(offset.min(table.columns.len()), column);
    Ok(())
}

/// Puts `column` where `old` was, or at `position` if one is given.
fn replace_column(
    table: &mut TableInfo,
    old: ColumnId,
    column: ColumnInfo,
    position: &ColumnPosition,
) -> Result<()> {
    let at = table
        .columns
        .iter()
        .position(|c| c.id == old)
        .ok_or_else(|| Error::internal(format!("column {old} vanished from table {}", table.name)))?;
    table.columns.remove(at);
    match position {
        ColumnPosition::Default => {
            table.columns.insert(at, column);
            Ok(())
        }
        _ => insert_at(table, column, position),
    }
}

/// Columns an add or drop job moves together.
fn tracked_columns(job: &Job) -> Vec<ColumnId> {
    if job.progress.column_ids.is_empty() {
        job.progress.column_id.into_iter().collect()
    } else {
        job.progress.column_ids.clone()
    }
}

fn set_states(table: &mut TableInfo, ids: &[ColumnId], state: SchemaState) -> Result<()> {
    for id in ids {
        column_in(table, *id)?.state = state;
    }
    Ok(())
}

/// `ADD COLUMN`: none, delete-only, write-only, write-reorganization, public.
/// Several clauses of one statement move through the states together.
///
/// Rows written before the column existed read its original default, so no
/// data is rewritten.
#[derive(Debug, Clone, Copy)]
pub struct AddColumn;

impl AddColumn {
    fn clauses(job: &Job) -> Result<Vec<NewColumn>> {
        match &job.args {
            JobArgs::AddColumn { column, position } => Ok(vec![NewColumn {
                column: column.clone(),
                position: position.clone(),
            }]),
            JobArgs::AddColumns { columns } => Ok(columns.clone()),
            _ => Err(unexpected_state(job)),
        }
    }
}

#[async_trait]
impl Transition for AddColumn {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let clauses = Self::clauses(&ctx.job)?;
        let mut table = ctx.table().await?;
        match ctx.job.schema_state {
            SchemaState::None => {
                let mut ids = Vec::with_capacity(clauses.len());
                for clause in &clauses {
                    let id = table.alloc_column_id();
                    let mut info = column_info(&clause.column, id, SchemaState::DeleteOnly)?;
                    info.origin_default = Some(info.insert_default());
                    insert_at(&mut table, info, &clause.position)?;
                    ids.push(id);
                }
                ctx.job.progress.column_id = ids.first().copied();
                ctx.job.progress.column_ids = ids;
                ctx.advance(table, SchemaState::DeleteOnly);
            }
            state @ (SchemaState::DeleteOnly
            | SchemaState::WriteOnly
            | SchemaState::WriteReorganization) => {
                let next = state.next_on_add().ok_or_else(|| unexpected_state(&ctx.job))?;
                set_states(&mut table, &tracked_columns(&ctx.job), next)?;
                ctx.advance(table, next);
                if next.is_public() {
                    ctx.finish()?;
                }
            }
            SchemaState::DeleteReorganization | SchemaState::Public => {
                return Err(unexpected_state(&ctx.job));
            }
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        retract_added_column(ctx).await
    }
}

/// Moves columns on the add path one state back; at delete-only they are
/// removed.
async fn retract_added_column(ctx: &mut StepContext) -> Result<()> {
    let state = ctx.job.schema_state;
    if state == SchemaState::None {
        return ctx.finish_rollback();
    }
    let ids = match ctx.job.progress.changing_column_id {
        Some(hidden) => vec![hidden],
        None => tracked_columns(&ctx.job),
    };
    if ids.is_empty() {
        return ctx.finish_rollback();
    }
    let mut table = ctx.table().await?;
    match state {
        SchemaState::DeleteOnly => {
            table.columns.retain(|c| !ids.contains(&c.id));
            ctx.advance(table, SchemaState::None);
            ctx.discard_reorg().await?;
            ctx.finish_rollback()
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            let prev = state.prev_on_add().ok_or_else(|| unexpected_state(&ctx.job))?;
            set_states(&mut table, &ids, prev)?;
            ctx.advance(table, prev);
            Ok(())
        }
        SchemaState::None | SchemaState::DeleteReorganization | SchemaState::Public => {
            Err(unexpected_state(&ctx.job))
        }
    }
}

/// `DROP COLUMN`: public, write-only, delete-only, delete-reorganization
/// (cells purged), then removed. Several clauses share one purge pass.
#[derive(Debug, Clone, Copy)]
pub struct DropColumn;

impl DropColumn {
    /// Resolves the dropped names to column IDs on the first step.
    fn resolve(ctx: &mut StepContext, table: &TableInfo) -> Result<Vec<ColumnId>> {
        let tracked = tracked_columns(&ctx.job);
        if !tracked.is_empty() {
            return Ok(tracked);
        }
        let names = match &ctx.job.args {
            JobArgs::DropColumn { name } => vec![name.clone()],
            JobArgs::DropColumns { names } => names.clone(),
            _ => return Err(unexpected_state(&ctx.job)),
        };
        let ids = names
            .into_iter()
            .map(|name| {
                table
                    .public_column(&name)
                    .map(|c| c.id)
                    .ok_or(Error::ColumnNotExists { name })
            })
            .collect::<Result<Vec<_>>>()?;
        ctx.job.progress.column_id = ids.first().copied();
        ctx.job.progress.column_ids = ids.clone();
        Ok(ids)
    }
}

#[async_trait]
impl Transition for DropColumn {
    fn initial_state(&self) -> SchemaState {
        SchemaState::Public
    }

    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let mut table = ctx.table().await?;
        let ids = Self::resolve(ctx, &table)?;

        match ctx.job.schema_state {
            state @ (SchemaState::Public | SchemaState::WriteOnly | SchemaState::DeleteOnly) => {
                let next = state.next_on_drop().ok_or_else(|| unexpected_state(&ctx.job))?;
                set_states(&mut table, &ids, next)?;
                ctx.advance(table, next);
            }
            SchemaState::DeleteReorganization => {
                let task = match ids.as_slice() {
                    [column] => ReorgTask::PurgeColumn { column: *column },
                    _ => ReorgTask::PurgeColumns,
                };
                if ctx.reorg_done(&task).await?.is_none() {
                    return Ok(StepOutcome::Reorg(task));
                }
                table.columns.retain(|c| !ids.contains(&c.id));
                ctx.advance(table, SchemaState::None);
                ctx.finish()?;
            }
            SchemaState::None | SchemaState::WriteReorganization => {
                return Err(unexpected_state(&ctx.job));
            }
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        let ids = tracked_columns(&ctx.job);
        let table = if ids.is_empty() {
            None
        } else {
            Some(ctx.table().await?)
        };
        rollback_drop(ctx, |t| set_states(t, &ids, SchemaState::Public), table)
    }
}

/// `MODIFY COLUMN`.
///
/// Changes that keep every stored value valid (renames, widening, new
/// defaults) are published in one step. Everything else goes through a
/// hidden replacement column on the add path with a backfill at
/// write-reorganization.
#[derive(Debug, Clone, Copy)]
pub struct ModifyColumn;

impl ModifyColumn {
    fn modify_in_place(
        ctx: &mut StepContext,
        mut table: TableInfo,
        old: &ColumnInfo,
        def: &ColumnDef,
        position: &ColumnPosition,
    ) -> Result<()> {
        let mut info = column_info(def, old.id, SchemaState::Public)?;
        info.origin_default = old
            .origin_default
            .as_ref()
            .map(|v| def.field_type.convert(v))
            .transpose()
            .map_err(|reason| Error::DataTruncated {
                column: old.name.clone(),
                reason,
            })?;
        info.primary_key = old.primary_key;
        replace_column(&mut table, old.id, info, position)?;
        ctx.job.progress.column_id = Some(old.id);
        ctx.advance(table, SchemaState::Public);
        ctx.finish()
    }

    fn add_changing_column(
        ctx: &mut StepContext,
        mut table: TableInfo,
        old: &ColumnInfo,
        def: &ColumnDef,
    ) -> Result<()> {
        let id = table.alloc_column_id();
        let mut hidden = column_info(def, id, SchemaState::DeleteOnly)?;
        hidden.name = format!("_col$_{}_{}", old.name, id);
        hidden.changing_from = Some(old.id);
        table.columns.push(hidden);
        ctx.job.progress.column_id = Some(old.id);
        ctx.job.progress.changing_column_id = Some(id);
        ctx.job.progress.needs_reorg = true;
        ctx.advance(table, SchemaState::DeleteOnly);
        Ok(())
    }

    /// Replaces the original column with the backfilled hidden one.
    fn swap(
        ctx: &mut StepContext,
        mut table: TableInfo,
        from: ColumnId,
        to: ColumnId,
        def: &ColumnDef,
        position: &ColumnPosition,
    ) -> Result<()> {
        let old = table
            .column(from)
            .cloned()
            .ok_or_else(|| unexpected_state(&ctx.job))?;
        let mut info = table
            .column(to)
            .cloned()
            .ok_or_else(|| unexpected_state(&ctx.job))?;
        info.origin_default = convert_for_changing(&old, &info, &BTreeMap::new())
            .ok()
            .filter(|v| !v.is_null());
        info.name = def.name.clone();
        info.changing_from = None;
        info.state = SchemaState::Public;

        table.columns.retain(|c| c.id != to);
        replace_column(&mut table, from, info, position)?;
        for column in &mut table.columns {
            if let Some(generated) = column.generated.as_mut() {
                if generated.base == from {
                    generated.base = to;
                }
            }
        }
        ctx.job.progress.column_id = Some(to);
        ctx.job.progress.changing_column_id = None;
        ctx.advance(table, SchemaState::Public);
        ctx.finish()?;
        info!(column = %def.name, "column retyped");
        Ok(())
    }
}

#[async_trait]
impl Transition for ModifyColumn {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::ModifyColumn {
            name,
            column: def,
            position,
        } = ctx.job.args.clone()
        else {
            return Err(unexpected_state(&ctx.job));
        };
        let mut table = ctx.table().await?;

        match ctx.job.schema_state {
            SchemaState::None => {
                let old = table
                    .public_column(&name)
                    .cloned()
                    .ok_or(Error::ColumnNotExists { name })?;
                if needs_reorg(&old, &def) {
                    Self::add_changing_column(ctx, table, &old, &def)?;
                } else {
                    Self::modify_in_place(ctx, table, &old, &def, &position)?;
                }
            }
            state @ (SchemaState::DeleteOnly | SchemaState::WriteOnly) => {
                let next = state.next_on_add().ok_or_else(|| unexpected_state(&ctx.job))?;
                let hidden = ctx
                    .job
                    .progress
                    .changing_column_id
                    .ok_or_else(|| unexpected_state(&ctx.job))?;
                column_in(&mut table, hidden)?.state = next;
                ctx.advance(table, next);
            }
            SchemaState::WriteReorganization => {
                let from = tracked_column(&ctx.job)?;
                let to = ctx
                    .job
                    .progress
                    .changing_column_id
                    .ok_or_else(|| unexpected_state(&ctx.job))?;
                let task = ReorgTask::ModifyColumn { from, to };
                if ctx.reorg_done(&task).await?.is_none() {
                    return Ok(StepOutcome::Reorg(task));
                }
                Self::swap(ctx, table, from, to, &def, &position)?;
            }
            SchemaState::DeleteReorganization | SchemaState::Public => {
                return Err(unexpected_state(&ctx.job));
            }
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        if ctx.job.progress.changing_column_id.is_none() {
            return rollback_nothing(ctx);
        }
        retract_added_column(ctx).await
    }
}

/// `ALTER COLUMN ... SET DEFAULT`: a single step.
#[derive(Debug, Clone, Copy)]
pub struct SetDefaultValue;

#[async_trait]
impl Transition for SetDefaultValue {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::SetDefaultValue { name, default } = ctx.job.args.clone() else {
            return Err(unexpected_state(&ctx.job));
        };
        let mut table = ctx.table().await?;
        let id = table
            .public_column(&name)
            .map(|c| c.id)
            .ok_or_else(|| Error::ColumnNotExists { name: name.clone() })?;
        let column = column_in(&mut table, id)?;
        column.default = default
            .map(|v| column.field_type.convert(&v))
            .transpose()
            .map_err(|reason| Error::InvalidRequest(format!("invalid default value for '{name}': {reason}")))?;
        ctx.job.progress.column_id = Some(id);
        ctx.advance(table, SchemaState::Public);
        ctx.finish()?;
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        rollback_nothing(ctx)
    }
}
