//! # keel-ddl
//!
//! Online, asynchronous schema changes for keel.
//!
//! A DDL statement becomes a persisted [`Job`](model::Job). One elected owner
//! per cluster drives each job through a sequence of schema states
//! (delete-only, write-only, write-reorganization, public, or the reverse for
//! drops), publishing a new schema version per state and waiting until every
//! live node has loaded it before taking the next step. Existing data is
//! backfilled by a pool of checkpointed workers that never overwrite a newer
//! foreground write.
//!
//! ## Modules
//!
//! - [`queue`]: durable FIFO of jobs and submission-time validation
//! - [`scheduler`]: the owner loop, one runner per table
//! - [`runner`] and [`transition`]: the generic state machine and the
//!   per-operation steps
//! - [`reorg`]: parallel backfill workers
//! - [`schema`] and [`lease`]: versioned metadata and cross-node convergence
//! - [`node`]: serving nodes and the foreground statement path
//! - [`hooks`]: observation points for tests and tooling
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use keel_core::kv::MemoryStore;
//! use keel_ddl::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let store = MemoryStore::shared();
//! let elector = Arc::new(MemoryOwnerElector::new(Duration::from_secs(3)));
//! let node = Node::start(store, elector, DdlConfig::default(), Arc::new(NoopHook)).await?;
//!
//! node.create_database("app").await?;
//! let table = TableDef {
//!     name: "t".into(),
//!     columns: vec![ColumnDef::new("id", FieldType::Int).primary_key()],
//!     indexes: vec![],
//! };
//! node.execute(node.create_table_request("app", table)?).await?;
//!
//! let add = JobArgs::AddColumn {
//!     column: ColumnDef::new("c", FieldType::Int).not_null().default_value(1_i64),
//!     position: ColumnPosition::Default,
//! };
//! node.execute(node.request("app", "t", add)?).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gc;
pub mod hooks;
pub mod keys;
pub mod lease;
pub mod metrics;
pub mod model;
pub mod node;
pub mod owner;
pub mod queue;
pub mod reorg;
pub mod runner;
pub mod scheduler;
pub mod schema;
pub mod table;
pub mod transition;
pub mod validate;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::DdlConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::hooks::{DdlHook, NoopHook};
    pub use crate::model::{
        ColumnDef, ColumnPosition, Datum, FieldType, IndexDef, Job, JobArgs, JobRequest,
        JobState, JobType, SchemaState, TableDef,
    };
    pub use crate::node::{Node, Session};
    pub use crate::owner::memory::MemoryOwnerElector;
    pub use crate::owner::store::StoreOwnerElector;
    pub use crate::owner::OwnerElector;
}
