//! Strongly-typed identifiers for keel entities.
//!
//! Catalog objects (schemas, tables, columns, indexes) and DDL jobs carry
//! integer identifiers allocated from persisted counters, so they are stable
//! across schema versions and order by allocation. Serving nodes are named by
//! ULIDs generated locally without coordination.
//!
//! # Example
//!
//! ```rust
//! use keel_core::id::{NodeId, TableId};
//!
//! let table = TableId::new(42);
//! assert_eq!(table.get(), 42);
//!
//! let node = NodeId::generate();
//! assert_ne!(node, NodeId::generate());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<i64>()
                    .map(Self)
                    .map_err(|e| Error::InvalidInput(format!("invalid {} '{s}': {e}", $label)))
            }
        }
    };
}

int_id!(
    /// Identifier of a DDL job. Allocated from the global job sequence, so
    /// ordering by ID is submission order.
    JobId,
    "job ID"
);

int_id!(
    /// Identifier of a database (schema).
    SchemaId,
    "schema ID"
);

int_id!(
    /// Identifier of a table. Truncation assigns a fresh ID.
    TableId,
    "table ID"
);

int_id!(
    /// Identifier of a column, unique within its table.
    ColumnId,
    "column ID"
);

int_id!(
    /// Identifier of an index, unique within its table.
    IndexId,
    "index ID"
);

/// A unique identifier for a serving node.
///
/// Node IDs key the per-node lease records and identify DDL owner candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Ulid);

impl NodeId {
    /// Generates a new unique node ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a node ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid node ID '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ids_round_trip_through_strings() -> Result<()> {
        let id: TableId = "117".parse()?;
        assert_eq!(id, TableId::new(117));
        assert_eq!(id.to_string(), "117");
        Ok(())
    }

    #[test]
    fn int_ids_reject_garbage() {
        let err = "t1".parse::<JobId>().unwrap_err();
        assert!(err.to_string().contains("invalid job ID"));
    }

    #[test]
    fn node_ids_serialize_transparently() -> Result<()> {
        let node = NodeId::generate();
        let json = serde_json::to_string(&node)?;
        assert_eq!(json, format!("\"{node}\""));
        let parsed: NodeId = serde_json::from_str(&json)?;
        assert_eq!(parsed, node);
        Ok(())
    }

    #[test]
    fn job_ids_order_by_allocation() {
        assert!(JobId::new(3) < JobId::new(10));
    }
}
