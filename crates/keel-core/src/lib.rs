//! # keel-core
//!
//! Shared primitives for the keel distributed SQL engine.
//!
//! - **Identifiers**: strongly-typed IDs for jobs, tables, columns, indexes and nodes
//! - **Transactional store**: the snapshot-isolated key-value capability
//!   ([`kv::TxnStore`]) and its in-memory implementation
//! - **Error types**: shared error definitions and result types
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::shared();
//! let mut txn = Transaction::begin(store.clone()).await?;
//! txn.put("greeting", "hello");
//! txn.commit().await?;
//!
//! let snapshot = Snapshot::latest(store).await?;
//! assert!(snapshot.get(b"greeting").await?.is_some());
//! # Ok::<(), Error>(())
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod kv;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ColumnId, IndexId, JobId, NodeId, SchemaId, TableId};
    pub use crate::kv::{
        CommitInfo, KeyRange, MemoryStore, Mutation, Snapshot, Timestamp, Transaction, TxnStore,
    };
}
