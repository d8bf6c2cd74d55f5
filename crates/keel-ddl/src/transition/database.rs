//! Database-level operations.

use async_trait::async_trait;
use keel_core::id::TableId;
use keel_core::kv::KeyRange;
use tracing::info;

use super::{unexpected_state, StepContext, StepOutcome, Transition};
use crate::error::{Error, Result};
use crate::model::{DatabaseInfo, SchemaState};
use crate::table::codec;

/// `DROP DATABASE`: public, write-only, delete-only, delete-reorganization,
/// then removed together with every table in it.
///
/// Name lookups stop resolving the database once it leaves public. The
/// tables keep their definitions until the last step, which removes them in
/// the same version as the database and purges their data through delete
/// ranges once the job is archived.
#[derive(Debug, Clone, Copy)]
pub struct DropDatabase;

impl DropDatabase {
    async fn database(ctx: &mut StepContext) -> Result<DatabaseInfo> {
        let id = ctx.job.schema_id;
        ctx.meta()
            .database(id)
            .await?
            .ok_or_else(|| Error::DatabaseNotExists {
                name: ctx.job.table_name.clone(),
            })
    }
}

#[async_trait]
impl Transition for DropDatabase {
    fn initial_state(&self) -> SchemaState {
        SchemaState::Public
    }

    async fn step(&self, ctx: &mut StepContext) -> Result<StepOutcome> {
        let mut db = Self::database(ctx).await?;
        let next = ctx
            .job
            .schema_state
            .next_on_drop()
            .ok_or_else(|| unexpected_state(&ctx.job))?;
        ctx.diff.database_changed = true;

        if next == SchemaState::None {
            let tables: Vec<TableId> = ctx
                .meta()
                .tables()
                .await?
                .into_iter()
                .filter(|t| t.schema_id == db.id)
                .map(|t| t.id)
                .collect();
            for id in &tables {
                ctx.remove_table(*id);
                ctx.delete_ranges.push(KeyRange::prefix(&codec::table_prefix(*id)));
            }
            ctx.diff.identity_changed = !tables.is_empty();
            ctx.meta().remove_database(db.id);
            ctx.job.schema_state = SchemaState::None;
            ctx.finish()?;
            info!(database = %db.name, tables = tables.len(), "database dropped");
        } else {
            db.state = next;
            ctx.meta().put_database(&db)?;
            ctx.job.schema_state = next;
        }
        Ok(StepOutcome::Commit)
    }

    async fn rollback_step(&self, ctx: &mut StepContext) -> Result<()> {
        match ctx.job.schema_state {
            SchemaState::WriteOnly => {
                let mut db = Self::database(ctx).await?;
                db.state = SchemaState::Public;
                ctx.meta().put_database(&db)?;
                ctx.diff.database_changed = true;
                ctx.job.schema_state = SchemaState::Public;
                ctx.finish_rollback()
            }
            SchemaState::Public | SchemaState::None => {
                ctx.job.schema_state = SchemaState::Public;
                ctx.finish_rollback()
            }
            _ => Err(Error::CannotCancel {
                job_id: ctx.job.id,
                schema_state: ctx.job.schema_state.to_string(),
            }),
        }
    }
}
