//! Schema version store: the versioned catalog and its snapshots.

pub mod info;
pub mod meta;

pub use info::{InfoSchema, PublicSchema, PublicTable, SchemaLoader};
pub use meta::{Meta, SchemaDiff, TableChange, TableHistoryEntry};
