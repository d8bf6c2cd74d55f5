//! Persisted data model: jobs, states and versioned table definitions.

pub mod job;
pub mod meta;
pub mod state;

pub use job::{Job, JobArgs, JobProgress, JobRequest, JobType, NewColumn, NO_TABLE};
pub use meta::{
    names_eq, ColumnDef, ColumnInfo, ColumnPosition, DatabaseInfo, Datum, FieldType,
    GeneratedDef, GeneratedInfo, IndexDef, IndexInfo, TableDef, TableInfo, PRIMARY_KEY_NAME,
};
pub use state::{JobState, SchemaState, ADD_PATH, DROP_PATH};
