//! Pre-built table definitions and statement helpers.

use std::future::Future;
use std::time::Duration;

use keel_ddl::error::Result;
use keel_ddl::model::{ColumnDef, Datum, FieldType, IndexDef, TableDef};
use keel_ddl::node::Session;

/// Attempts a statement makes before giving up on a changing schema.
const STATEMENT_ATTEMPTS: u32 = 20;

/// `t(c1 varchar(64), c2 enum('N','Y') default 'N', c4 int primary key)`.
pub fn enum_table() -> TableDef {
    TableDef {
        name: "t".into(),
        columns: vec![
            ColumnDef::new("c1", FieldType::varchar(64)),
            ColumnDef::new("c2", FieldType::enumeration(["N", "Y"])).default_value("N"),
            ColumnDef::new("c4", FieldType::Int).primary_key(),
        ],
        indexes: Vec::new(),
    }
}

/// `t(a int primary key, b int, c int)` with no secondary indexes.
pub fn abc_table(name: &str) -> TableDef {
    TableDef {
        name: name.into(),
        columns: vec![
            ColumnDef::new("a", FieldType::Int).primary_key(),
            ColumnDef::new("b", FieldType::Int),
            ColumnDef::new("c", FieldType::Int),
        ],
        indexes: Vec::new(),
    }
}

/// Like [`abc_table`] with a secondary index `idx_c(c)`.
pub fn abc_table_indexed(name: &str) -> TableDef {
    TableDef {
        indexes: vec![IndexDef::new("idx_c", ["c"])],
        ..abc_table(name)
    }
}

/// Inserts rows `(a, a * 10, a % 7)` for every `a` in `handles` into an
/// [`abc_table`].
///
/// # Errors
///
/// Returns the first statement failure that is not a retryable schema change.
pub async fn fill_abc(session: &Session, table: &str, handles: std::ops::Range<i64>) -> Result<()> {
    for a in handles {
        retry_statement(|| async move {
            let row = [
                ("a", Datum::Int(a)),
                ("b", Datum::Int(a * 10)),
                ("c", Datum::Int(a % 7)),
            ];
            session.insert(table, &row).await
        })
        .await?;
    }
    Ok(())
}

/// Runs a statement, retrying while it fails with a retryable error such as
/// a schema change racing its commit.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts
/// run out.
pub async fn retry_statement<F, Fut, T>(mut statement: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match statement().await {
            Err(err) if err.is_retryable() && attempt < STATEMENT_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            result => return result,
        }
    }
}
