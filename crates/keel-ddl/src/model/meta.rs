//! Table, column and index definitions.
//!
//! Definitions reference each other by ID (an index lists the [`ColumnId`]s it
//! covers, a generated column names its base column by ID), never by position
//! or pointer, so an old and a new version of a table can be held side by side
//! while a change rolls out.

use std::fmt;

use keel_core::id::{ColumnId, IndexId, SchemaId, TableId};
use serde::{Deserialize, Serialize};

use super::state::SchemaState;

/// Name of the primary key index.
pub const PRIMARY_KEY_NAME: &str = "PRIMARY";

/// Compares identifiers the way the SQL layer does (ASCII case-insensitive).
#[must_use]
pub fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    /// SQL NULL.
    #[default]
    Null,
    /// Any integer type.
    Int(i64),
    /// Strings and enum members.
    Str(String),
}

impl Datum {
    /// Returns true for NULL.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer value, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// 8-bit signed integer.
    TinyInt,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// Variable-length string of at most `len` characters.
    Varchar {
        /// Maximum length in characters.
        len: u32,
    },
    /// One of a fixed list of strings.
    Enum {
        /// Allowed members in declaration order.
        members: Vec<String>,
    },
}

impl FieldType {
    /// Returns `varchar(len)`.
    #[must_use]
    pub const fn varchar(len: u32) -> Self {
        Self::Varchar { len }
    }

    /// Returns an enum over `members`.
    #[must_use]
    pub fn enumeration<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true for integer types.
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::TinyInt | Self::Int | Self::BigInt)
    }

    const fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            Self::TinyInt => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::Int => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::BigInt => Some((i64::MIN, i64::MAX)),
            Self::Varchar { .. } | Self::Enum { .. } => None,
        }
    }

    /// The implicit default of a NOT NULL column without an explicit default.
    #[must_use]
    pub fn zero_value(&self) -> Datum {
        match self {
            Self::TinyInt | Self::Int | Self::BigInt => Datum::Int(0),
            Self::Varchar { .. } => Datum::Str(String::new()),
            Self::Enum { members } => members.first().cloned().map_or(Datum::Null, Datum::Str),
        }
    }

    /// Converts a value into this type.
    ///
    /// # Errors
    ///
    /// Returns a description of why the value does not fit.
    pub fn convert(&self, value: &Datum) -> std::result::Result<Datum, String> {
        match (self, value) {
            (_, Datum::Null) => Ok(Datum::Null),
            (Self::TinyInt | Self::Int | Self::BigInt, Datum::Int(v)) => self.check_int(*v),
            (Self::TinyInt | Self::Int | Self::BigInt, Datum::Str(s)) => {
                let parsed = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| format!("invalid integer value '{s}'"))?;
                self.check_int(parsed)
            }
            (Self::Varchar { len }, Datum::Int(v)) => Self::check_len(v.to_string(), *len),
            (Self::Varchar { len }, Datum::Str(s)) => Self::check_len(s.clone(), *len),
            (Self::Enum { members }, Datum::Str(s)) => members
                .iter()
                .find(|m| names_eq(m, s))
                .map(|m| Datum::Str(m.clone()))
                .ok_or_else(|| format!("'{s}' is not a member of {self}")),
            (Self::Enum { members }, Datum::Int(v)) => usize::try_from(*v)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| members.get(i))
                .map(|m| Datum::Str(m.clone()))
                .ok_or_else(|| format!("{v} is not a member index of {self}")),
        }
    }

    fn check_int(&self, v: i64) -> std::result::Result<Datum, String> {
        match self.int_range() {
            Some((lo, hi)) if v < lo || v > hi => Err(format!("value {v} out of range for {self}")),
            _ => Ok(Datum::Int(v)),
        }
    }

    fn check_len(s: String, len: u32) -> std::result::Result<Datum, String> {
        let chars = s.chars().count();
        if u32::try_from(chars).map_or(true, |n| n > len) {
            return Err(format!("string length {chars} exceeds varchar({len})"));
        }
        Ok(Datum::Str(s))
    }

    /// Returns true if changing a column from `old` to `self` requires
    /// rewriting stored values.
    ///
    /// Widening integers, lengthening a varchar and appending enum members are
    /// metadata-only; everything else is reorganized.
    #[must_use]
    pub fn needs_reorg_from(&self, old: &Self) -> bool {
        match (old, self) {
            (old, new) if old.is_integer() && new.is_integer() => {
                match (old.int_range(), new.int_range()) {
                    (Some((old_lo, old_hi)), Some((new_lo, new_hi))) => {
                        new_lo > old_lo || new_hi < old_hi
                    }
                    _ => true,
                }
            }
            (Self::Varchar { len: old_len }, Self::Varchar { len: new_len }) => new_len < old_len,
            (Self::Enum { members: old_m }, Self::Enum { members: new_m }) => {
                !(new_m.len() >= old_m.len() && new_m.iter().zip(old_m).all(|(a, b)| a == b))
            }
            _ => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TinyInt => f.write_str("tinyint"),
            Self::Int => f.write_str("int"),
            Self::BigInt => f.write_str("bigint"),
            Self::Varchar { len } => write!(f, "varchar({len})"),
            Self::Enum { members } => {
                let quoted: Vec<String> = members.iter().map(|m| format!("'{m}'")).collect();
                write!(f, "enum({})", quoted.join(","))
            }
        }
    }
}

/// Where a new or moved column goes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPosition {
    /// Unchanged for modified columns, last for added ones.
    #[default]
    Default,
    /// First column.
    First,
    /// Right after the named column.
    After(String),
}

/// Definition of a generated column as requested: `base + offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDef {
    /// Name of the column the value is computed from.
    pub base: String,
    /// Constant added to the base value.
    pub offset: i64,
}

/// A column definition as it appears in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub field_type: FieldType,
    /// Rejects NULL.
    #[serde(default)]
    pub not_null: bool,
    /// Explicit default.
    #[serde(default)]
    pub default: Option<Datum>,
    /// Single-column integer primary key (the row handle).
    #[serde(default)]
    pub primary_key: bool,
    /// Generated-column expression.
    #[serde(default)]
    pub generated: Option<GeneratedDef>,
}

impl ColumnDef {
    /// Creates a nullable column without a default.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            not_null: false,
            default: None,
            primary_key: false,
            generated: None,
        }
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Datum>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Makes the column the integer primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    /// Makes the column generated as `base + offset`.
    #[must_use]
    pub fn generated(mut self, base: impl Into<String>, offset: i64) -> Self {
        self.generated = Some(GeneratedDef {
            base: base.into(),
            offset,
        });
        self
    }
}

/// An index definition as it appears in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name; `PRIMARY` for primary keys.
    pub name: String,
    /// Covered column names, in key order.
    pub columns: Vec<String>,
    /// Enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
    /// Is the primary key.
    #[serde(default)]
    pub primary: bool,
}

impl IndexDef {
    /// Creates a non-unique secondary index.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            primary: false,
        }
    }

    /// Creates a primary key over `columns`.
    pub fn primary<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: PRIMARY_KEY_NAME.to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: true,
            primary: true,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A table definition as it appears in a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns in order.
    pub columns: Vec<ColumnDef>,
    /// Secondary indexes and non-handle primary keys.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

/// A generated column's expression, resolved to IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedInfo {
    /// Column the value is computed from.
    pub base: ColumnId,
    /// Constant added to the base value.
    pub offset: i64,
}

/// A column at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Stable column ID.
    pub id: ColumnId,
    /// Column name. Hidden changing columns carry a reserved name.
    pub name: String,
    /// Column type.
    pub field_type: FieldType,
    /// Rejects NULL.
    pub not_null: bool,
    /// Default for inserts that omit the column.
    pub default: Option<Datum>,
    /// Value read for rows written before the column existed.
    pub origin_default: Option<Datum>,
    /// Integer primary key used as the row handle.
    pub primary_key: bool,
    /// Generated-column expression.
    pub generated: Option<GeneratedInfo>,
    /// Visibility.
    pub state: SchemaState,
    /// Set on the hidden column that will replace the given column once a
    /// retyping change completes.
    pub changing_from: Option<ColumnId>,
}

impl ColumnInfo {
    /// Value written when an insert omits this column.
    #[must_use]
    pub fn insert_default(&self) -> Datum {
        match &self.default {
            Some(value) => value.clone(),
            None if self.not_null => self.field_type.zero_value(),
            None => Datum::Null,
        }
    }

    /// Value read for rows that carry no cell for this column.
    #[must_use]
    pub fn missing_value(&self) -> Datum {
        self.origin_default.clone().unwrap_or_default()
    }

    /// Returns true for internal columns that are never user-visible.
    #[must_use]
    pub const fn is_hidden(&self) -> bool {
        self.changing_from.is_some()
    }
}

/// An index at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Stable index ID.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Covered columns, in key order.
    pub columns: Vec<ColumnId>,
    /// Enforces uniqueness.
    pub unique: bool,
    /// Is the primary key.
    pub primary: bool,
    /// Visibility.
    pub state: SchemaState,
}

/// A database at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database ID.
    pub id: SchemaId,
    /// Database name.
    pub name: String,
    /// Visibility; only a drop moves it off public.
    #[serde(default = "public_state")]
    pub state: SchemaState,
}

const fn public_state() -> SchemaState {
    SchemaState::Public
}

/// A table at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table ID; changes on truncate.
    pub id: TableId,
    /// Owning database.
    pub schema_id: SchemaId,
    /// Table name.
    pub name: String,
    /// Columns in display order, including non-public ones.
    pub columns: Vec<ColumnInfo>,
    /// Indexes, including non-public ones.
    pub indexes: Vec<IndexInfo>,
    /// The integer primary key column is the row handle.
    pub pk_is_handle: bool,
    /// Visibility of the table itself.
    pub state: SchemaState,
    /// Highest column ID allocated so far.
    pub max_column_id: i64,
    /// Highest index ID allocated so far.
    pub max_index_id: i64,
    /// Schema version that last changed this table.
    pub update_version: u64,
}

impl TableInfo {
    /// Finds a user-visible (non-hidden) column by name in any state.
    #[must_use]
    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| !c.is_hidden() && names_eq(&c.name, name))
    }

    /// Finds a public column by name.
    #[must_use]
    pub fn public_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.find_column(name).filter(|c| c.state.is_public())
    }

    /// Looks up a column by ID.
    #[must_use]
    pub fn column(&self, id: ColumnId) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Looks up a column by ID for mutation.
    pub fn column_mut(&mut self, id: ColumnId) -> Option<&mut ColumnInfo> {
        self.columns.iter_mut().find(|c| c.id == id)
    }

    /// Public columns in display order.
    pub fn public_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_public())
    }

    /// Finds an index by name in any state.
    #[must_use]
    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| names_eq(&i.name, name))
    }

    /// Looks up an index by ID.
    #[must_use]
    pub fn index(&self, id: IndexId) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// Looks up an index by ID for mutation.
    pub fn index_mut(&mut self, id: IndexId) -> Option<&mut IndexInfo> {
        self.indexes.iter_mut().find(|i| i.id == id)
    }

    /// The primary key index, if one exists in any state.
    #[must_use]
    pub fn primary_index(&self) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.primary)
    }

    /// The column whose value is the row handle.
    #[must_use]
    pub fn handle_column(&self) -> Option<&ColumnInfo> {
        if !self.pk_is_handle {
            return None;
        }
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Returns true if the table has a primary key of either kind.
    #[must_use]
    pub fn has_primary_key(&self) -> bool {
        self.pk_is_handle || self.primary_index().is_some()
    }

    /// Indexes covering the given column.
    pub fn indexes_covering(&self, column: ColumnId) -> impl Iterator<Item = &IndexInfo> {
        self.indexes
            .iter()
            .filter(move |i| i.columns.contains(&column))
    }

    /// Generated columns computed from the given column.
    pub fn dependents_of(&self, column: ColumnId) -> impl Iterator<Item = &ColumnInfo> {
        self.columns
            .iter()
            .filter(move |c| c.generated.is_some_and(|g| g.base == column))
    }

    /// The hidden column that will replace `column`, if a retype is running.
    #[must_use]
    pub fn changing_column_for(&self, column: ColumnId) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.changing_from == Some(column))
    }

    /// Allocates the next column ID.
    pub fn alloc_column_id(&mut self) -> ColumnId {
        self.max_column_id += 1;
        ColumnId::new(self.max_column_id)
    }

    /// Allocates the next index ID.
    pub fn alloc_index_id(&mut self) -> IndexId {
        self.max_index_id += 1;
        IndexId::new(self.max_index_id)
    }

    /// Resolves a position to an insertion offset in `columns`.
    ///
    /// # Errors
    ///
    /// Returns the missing column name when `After` names an unknown column.
    pub fn position_offset(&self, position: &ColumnPosition) -> std::result::Result<usize, String> {
        match position {
            ColumnPosition::Default => Ok(self.columns.len()),
            ColumnPosition::First => Ok(0),
            ColumnPosition::After(name) => self
                .columns
                .iter()
                .position(|c| !c.is_hidden() && names_eq(&c.name, name))
                .map(|i| i + 1)
                .ok_or_else(|| name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversion_checks_range() {
        assert_eq!(FieldType::TinyInt.convert(&Datum::Int(127)), Ok(Datum::Int(127)));
        assert!(FieldType::TinyInt.convert(&Datum::Int(128)).is_err());
        assert_eq!(
            FieldType::Int.convert(&Datum::from(" 42 ")),
            Ok(Datum::Int(42))
        );
        assert!(FieldType::BigInt.convert(&Datum::from("abc")).is_err());
    }

    #[test]
    fn varchar_conversion_checks_length() {
        let ty = FieldType::varchar(3);
        assert_eq!(ty.convert(&Datum::Int(123)), Ok(Datum::from("123")));
        assert!(ty.convert(&Datum::from("abcd")).is_err());
    }

    #[test]
    fn enum_conversion_is_case_insensitive() {
        let ty = FieldType::enumeration(["N", "Y"]);
        assert_eq!(ty.convert(&Datum::from("y")), Ok(Datum::from("Y")));
        assert_eq!(ty.convert(&Datum::Int(1)), Ok(Datum::from("N")));
        assert!(ty.convert(&Datum::from("maybe")).is_err());
        assert_eq!(ty.to_string(), "enum('N','Y')");
    }

    #[test]
    fn widening_changes_skip_reorg() {
        assert!(!FieldType::BigInt.needs_reorg_from(&FieldType::Int));
        assert!(FieldType::TinyInt.needs_reorg_from(&FieldType::Int));
        assert!(!FieldType::varchar(20).needs_reorg_from(&FieldType::varchar(10)));
        assert!(FieldType::varchar(5).needs_reorg_from(&FieldType::varchar(10)));
        assert!(FieldType::Int.needs_reorg_from(&FieldType::varchar(10)));
        assert!(!FieldType::enumeration(["a", "b", "c"])
            .needs_reorg_from(&FieldType::enumeration(["a", "b"])));
        assert!(FieldType::enumeration(["b", "a"])
            .needs_reorg_from(&FieldType::enumeration(["a", "b"])));
    }

    #[test]
    fn not_null_columns_default_to_zero_value() {
        let col = ColumnInfo {
            id: ColumnId::new(1),
            name: "c".into(),
            field_type: FieldType::Int,
            not_null: true,
            default: None,
            origin_default: None,
            primary_key: false,
            generated: None,
            state: SchemaState::Public,
            changing_from: None,
        };
        assert_eq!(col.insert_default(), Datum::Int(0));
        assert_eq!(col.missing_value(), Datum::Null);
    }
}
