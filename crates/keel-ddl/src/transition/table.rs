//! Table-level operations.

use async_trait::async_trait;
use keel_core::id::TableId;
use keel_core::kv::KeyRange;
use tracing::info;

use super::{rollback_drop, rollback_nothing, unexpected_state, StepContext, StepOutcome, Transition};
use crate::error::{Error, Result};
use crate::model::{JobArgs, SchemaState};
use crate::table::codec;
use crate::validate::build_table;

/// `CREATE TABLE`: a single step to public.
#[derive(Debug, Clone, Copy)]
pub struct CreateTable;

#[async_trait]
impl Transition for CreateTable {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::CreateTable { table: def } = &ctx.job.args else {
            return Err(unexpected_state(&ctx.job));
        };
        if ctx.job.schema_state != SchemaState::None {
            return Err(unexpected_state(&ctx.job));
        }
        let table = build_table(def, ctx.job.table_id, ctx.job.schema_id)?;
        ctx.advance(table, SchemaState::Public);
        ctx.finish()?;
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        rollback_nothing(ctx)
    }
}

/// `DROP TABLE`: public, write-only, delete-only, delete-reorganization,
/// then removed. The table's data is purged through a delete range once the
/// job is archived.
#[derive(Debug, Clone, Copy)]
pub struct DropTable;

#[async_trait]
impl Transition for DropTable {
    fn initial_state(&self) -> SchemaState {
        SchemaState::Public
    }

    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let mut table = ctx.table().await?;
        let next = ctx
            .job
            .schema_state
            .next_on_drop()
            .ok_or_else(|| unexpected_state(&ctx.job))?;
        if ctx.job.schema_state == SchemaState::Public {
            ctx.diff.identity_changed = true;
        }
        if next == SchemaState::None {
            ctx.remove_table(table.id);
            ctx.job.schema_state = SchemaState::None;
            ctx.delete_ranges.push(KeyRange::prefix(&codec::table_prefix(table.id)));
            ctx.finish()?;
            info!(table = %table.name, "table dropped");
        } else {
            table.state = next;
            ctx.advance(table, next);
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        let id = ctx.job.table_id;
        let table = ctx.meta().table(id).await?;
        rollback_drop(
            ctx,
            |t| {
                t.state = SchemaState::Public;
                Ok(())
            },
            table,
        )
    }
}

/// `TRUNCATE TABLE`: replaces the table with an empty copy under a new ID in
/// one step; the old ID's data is purged through a delete range.
#[derive(Debug, Clone, Copy)]
pub struct TruncateTable;

#[async_trait]
impl Transition for TruncateTable {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let old = ctx.table().await?;
        let new_id = ctx
            .meta()
            .alloc_global_ids(1)
            .await?
            .first()
            .copied()
            .map(TableId::new)
            .ok_or_else(|| Error::internal("ID allocator returned nothing"))?;

        let mut table = old.clone();
        table.id = new_id;
        ctx.remove_table(old.id);
        ctx.advance(table, SchemaState::Public);
        ctx.diff.old_table_id = Some(old.id);
        ctx.diff.identity_changed = true;
        ctx.delete_ranges.push(KeyRange::prefix(&codec::table_prefix(old.id)));
        ctx.job.progress.new_table_id = Some(new_id);
        ctx.finish()?;
        info!(table = %old.name, old_id = %old.id, new_id = %new_id, "table truncated");
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        rollback_nothing(ctx)
    }
}

/// `RENAME TABLE`: a single step.
#[derive(Debug, Clone, Copy)]
pub struct RenameTable;

#[async_trait]
impl Transition for RenameTable {
    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let JobArgs::RenameTable { new_name } = ctx.job.args.clone() else {
            return Err(unexpected_state(&ctx.job));
        };
        let mut table = ctx.table().await?;
        table.name = new_name;
        ctx.diff.identity_changed = true;
        ctx.advance(table, SchemaState::Public);
        ctx.finish()?;
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        rollback_nothing(ctx)
    }
}
