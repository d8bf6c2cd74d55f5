//! Index and primary key operations.

use async_trait::async_trait;
use keel_core::id::IndexId;
use keel_core::kv::KeyRange;

use super::{rollback_drop, unexpected_state, StepContext, StepOutcome, Transition};
use crate::error::{Error, Result};
use crate::model::{names_eq, IndexInfo, Job, JobArgs, SchemaState, TableInfo, PRIMARY_KEY_NAME};
use crate::reorg::ReorgTask;
use crate::table::codec;
use crate::validate::resolve_index;

fn tracked_index(job: &Job) -> Result<IndexId> {
    job.progress
        .index_id
        .ok_or_else(|| Error::internal(format!("job {} lost its index", job.id)))
}

fn index_in(table: &mut TableInfo, id: IndexId) -> Result<&mut IndexInfo> {
    let name = table.name.clone();
    table
        .index_mut(id)
        .ok_or_else(|| Error::internal(format!("index {id} vanished from table {name}")))
}

/// `ADD INDEX` and `ADD PRIMARY KEY`: none, delete-only, write-only,
/// write-reorganization (entries backfilled), public.
#[derive(Debug, Clone, Copy)]
pub struct AddIndex;

#[async_trait]
impl Transition for AddIndex {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::AddIndex { index: def } = ctx.job.args.clone() else {
            return Err(unexpected_state(&ctx.job));
        };
        let mut table = ctx.table().await?;
        match ctx.job.schema_state {
            SchemaState::None => {
                let id = table.alloc_index_id();
                let mut index = resolve_index(&table, &def, id)?;
                index.state = SchemaState::DeleteOnly;
                table.indexes.push(index);
                ctx.job.progress.index_id = Some(id);
                ctx.advance(table, SchemaState::DeleteOnly);
            }
            state @ (SchemaState::DeleteOnly | SchemaState::WriteOnly) => {
                let next = state.next_on_add().ok_or_else(|| unexpected_state(&ctx.job))?;
                index_in(&mut table, tracked_index(&ctx.job)?)?.state = next;
                ctx.advance(table, next);
            }
            SchemaState::WriteReorganization => {
                let id = tracked_index(&ctx.job)?;
                let task = ReorgTask::AddIndex { index_id: id };
                if ctx.reorg_done(&task).await?.is_none() {
                    return Ok(StepOutcome::Reorg(task));
                }
                let index = index_in(&mut table, id)?;
                index.state = SchemaState::Public;
                if index.primary {
                    let covered = index.columns.clone();
                    for column in table.columns.iter_mut().filter(|c| covered.contains(&c.id)) {
                        column.not_null = true;
                    }
                }
                ctx.advance(table, SchemaState::Public);
                ctx.finish()?;
            }
            SchemaState::DeleteReorganization | SchemaState::Public => {
                return Err(unexpected_state(&ctx.job));
            }
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        let state = ctx.job.schema_state;
        let Some(id) = ctx.job.progress.index_id else {
            return ctx.finish_rollback();
        };
        let mut table = ctx.table().await?;
        match state {
            SchemaState::DeleteOnly => {
                table.indexes.retain(|i| i.id != id);
                ctx.delete_ranges
                    .push(KeyRange::prefix(&codec::index_prefix(table.id, id)));
                ctx.advance(table, SchemaState::None);
                ctx.discard_reorg().await?;
                ctx.finish_rollback()
            }
            SchemaState::WriteOnly | SchemaState::WriteReorganization => {
                let prev = state.prev_on_add().ok_or_else(|| unexpected_state(&ctx.job))?;
                index_in(&mut table, id)?.state = prev;
                ctx.advance(table, prev);
                Ok(())
            }
            SchemaState::None => ctx.finish_rollback(),
            SchemaState::DeleteReorganization | SchemaState::Public => {
                Err(unexpected_state(&ctx.job))
            }
        }
    }
}

/// `DROP INDEX` and `DROP PRIMARY KEY`: public, write-only, delete-only,
/// delete-reorganization (entries purged), then removed.
#[derive(Debug, Clone, Copy)]
pub struct DropIndex;

#[async_trait]
impl Transition for DropIndex {
    fn initial_state(&self) -> SchemaState {
        SchemaState::Public
    }

    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::DropIndex { name } = ctx.job.args.clone() else {
            return Err(unexpected_state(&ctx.job));
        };
        let mut table = ctx.table().await?;
        let id = match ctx.job.progress.index_id {
            Some(id) => id,
            None => {
                let found = if names_eq(&name, PRIMARY_KEY_NAME) {
                    table.primary_index()
                } else {
                    table.find_index(&name)
                };
                let id = found
                    .filter(|i| i.state.is_public())
                    .map(|i| i.id)
                    .ok_or(Error::IndexNotExists { name })?;
                ctx.job.progress.index_id = Some(id);
                id
            }
        };

        match ctx.job.schema_state {
            state @ (SchemaState::Public | SchemaState::WriteOnly | SchemaState::DeleteOnly) => {
                let next = state.next_on_drop().ok_or_else(|| unexpected_state(&ctx.job))?;
                index_in(&mut table, id)?.state = next;
                ctx.advance(table, next);
            }
            SchemaState::DeleteReorganization => {
                let task = ReorgTask::PurgeIndex { index_id: id };
                if ctx.reorg_done(&task).await?.is_none() {
                    return Ok(StepOutcome::Reorg(task));
                }
                table.indexes.retain(|i| i.id != id);
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
        let id = ctx.job.progress.index_id;
        let table = match id {
            Some(_) => Some(ctx.table().await?),
            None => None,
        };
        rollback_drop(
            ctx,
            |t| {
                if let Some(id) = id {
                    index_in(t, id)?.state = SchemaState::Public;
                }
                Ok(())
            },
            table,
        )
    }
}
