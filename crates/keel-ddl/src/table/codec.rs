//! Row and index key encoding.
//!
//! Keys are memcomparable: byte order equals value order, so a range scan over
//! an index prefix walks entries in index order.
//!
//! ```text
//! row:    t{table_id}_r{handle}
//! index:  t{table_id}_i{index_id}{datum...}[{handle}]
//! ```
//!
//! Unique index keys end after the datums and store the handle as the value;
//! non-unique keys append the handle so entries for equal values stay distinct.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use keel_core::id::{ColumnId, IndexId, TableId};
use keel_core::kv::KeyRange;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Datum;

const TABLE_TAG: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";

const NULL_FLAG: u8 = 0x00;
const BYTES_FLAG: u8 = 0x01;
const INT_FLAG: u8 = 0x03;

const GROUP_SIZE: usize = 8;
const GROUP_MARKER: u8 = 0xFF;
const SIGN_MASK: u64 = 1 << 63;

/// Placeholder value of non-unique index entries.
pub const INDEX_PLACEHOLDER: &[u8] = b"0";

fn encode_i64(buf: &mut BytesMut, v: i64) {
    buf.put_u64(u64::from_ne_bytes(v.to_ne_bytes()) ^ SIGN_MASK);
}

fn decode_i64(raw: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = raw.try_into().ok()?;
    let bits = u64::from_be_bytes(arr) ^ SIGN_MASK;
    Some(i64::from_ne_bytes(bits.to_ne_bytes()))
}

fn table_prefix_into(buf: &mut BytesMut, table: TableId) {
    buf.put_u8(TABLE_TAG);
    encode_i64(buf, table.get());
}

/// Prefix of every key belonging to a table.
#[must_use]
pub fn table_prefix(table: TableId) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    table_prefix_into(&mut buf, table);
    buf.freeze()
}

/// Prefix of a table's rows.
#[must_use]
pub fn record_prefix(table: TableId) -> Bytes {
    let mut buf = BytesMut::with_capacity(11);
    table_prefix_into(&mut buf, table);
    buf.put_slice(RECORD_SEP);
    buf.freeze()
}

/// Range covering all rows of a table.
#[must_use]
pub fn record_range(table: TableId) -> KeyRange {
    KeyRange::prefix(&record_prefix(table))
}

/// Key of one row.
#[must_use]
pub fn record_key(table: TableId, handle: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    table_prefix_into(&mut buf, table);
    buf.put_slice(RECORD_SEP);
    encode_i64(&mut buf, handle);
    buf.freeze()
}

/// Extracts the handle from a row key.
///
/// # Errors
///
/// Returns an error if the key is not a row key.
pub fn decode_record_handle(key: &[u8]) -> Result<i64> {
    key.len()
        .checked_sub(8)
        .filter(|&at| at == 11 && key[9..11] == *RECORD_SEP)
        .and_then(|at| decode_i64(&key[at..]))
        .ok_or_else(|| Error::internal("malformed row key"))
}

/// Prefix of one index's entries.
#[must_use]
pub fn index_prefix(table: TableId, index: IndexId) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    table_prefix_into(&mut buf, table);
    buf.put_slice(INDEX_SEP);
    encode_i64(&mut buf, index.get());
    buf.freeze()
}

fn encode_datum(buf: &mut BytesMut, datum: &Datum) {
    match datum {
        Datum::Null => buf.put_u8(NULL_FLAG),
        Datum::Int(v) => {
            buf.put_u8(INT_FLAG);
            encode_i64(buf, *v);
        }
        Datum::Str(s) => {
            buf.put_u8(BYTES_FLAG);
            encode_bytes(buf, s.as_bytes());
        }
    }
}

/// Group-escaped byte encoding: 8-byte groups, zero padded, each followed by
/// a marker `0xFF - padding`.
fn encode_bytes(buf: &mut BytesMut, data: &[u8]) {
    let mut chunks = data.chunks(GROUP_SIZE).peekable();
    if chunks.peek().is_none() {
        buf.put_bytes(0, GROUP_SIZE);
        buf.put_u8(GROUP_MARKER - 8);
        return;
    }
    let mut last_full = false;
    for chunk in chunks {
        buf.put_slice(chunk);
        let pad = GROUP_SIZE - chunk.len();
        buf.put_bytes(0, pad);
        buf.put_u8(GROUP_MARKER - u8::try_from(pad).unwrap_or(8));
        last_full = pad == 0;
    }
    if last_full {
        buf.put_bytes(0, GROUP_SIZE);
        buf.put_u8(GROUP_MARKER - 8);
    }
}

/// Key of one index entry.
///
/// Unique entries whose values contain NULL behave as non-unique, so the
/// handle is appended for them too.
#[must_use]
pub fn index_key(
    table: TableId,
    index: IndexId,
    values: &[Datum],
    unique: bool,
    handle: i64,
) -> (Bytes, bool) {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_slice(&index_prefix(table, index));
    for value in values {
        encode_datum(&mut buf, value);
    }
    let distinct = unique && !values.iter().any(Datum::is_null);
    if !distinct {
        encode_i64(&mut buf, handle);
    }
    (buf.freeze(), distinct)
}

/// Value stored under a unique index key.
#[must_use]
pub fn unique_index_value(handle: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    encode_i64(&mut buf, handle);
    buf.freeze()
}

/// Decodes the handle stored under a unique index key.
///
/// # Errors
///
/// Returns an error if the value is malformed.
pub fn decode_unique_index_value(raw: &[u8]) -> Result<i64> {
    decode_i64(raw).ok_or_else(|| Error::internal("malformed unique index value"))
}

/// Stored form of a row: cell values by column ID.
///
/// Columns absent from the map were added after the row was written and
/// read as their original default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowValue {
    /// Cell values.
    pub cells: BTreeMap<ColumnId, Datum>,
}

impl RowValue {
    /// Encodes the row.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a row.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_keys_round_trip_handles() -> Result<()> {
        for handle in [i64::MIN, -1, 0, 1, 9, i64::MAX] {
            let key = record_key(TableId::new(5), handle);
            assert_eq!(decode_record_handle(&key)?, handle);
            assert!(record_range(TableId::new(5)).contains(&key));
            assert!(!record_range(TableId::new(6)).contains(&key));
        }
        Ok(())
    }

    #[test]
    fn unique_entries_with_null_keep_the_handle() {
        let (with_null, distinct) =
            index_key(TableId::new(1), IndexId::new(1), &[Datum::Null], true, 7);
        assert!(!distinct);
        let (plain, distinct) =
            index_key(TableId::new(1), IndexId::new(1), &[Datum::Int(3)], true, 7);
        assert!(distinct);
        assert!(with_null.len() > 19 && plain.len() > 19);
    }

    #[test]
    fn index_entries_stay_inside_their_prefix() {
        let prefix = index_prefix(TableId::new(2), IndexId::new(3));
        let (key, _) = index_key(
            TableId::new(2),
            IndexId::new(3),
            &[Datum::from("abc"), Datum::Int(-4)],
            false,
            11,
        );
        assert!(key.starts_with(&prefix));
        assert!(!record_range(TableId::new(2)).contains(&key));
    }

    #[test]
    fn row_values_round_trip() -> Result<()> {
        let mut row = RowValue::default();
        row.cells.insert(ColumnId::new(1), Datum::from("x"));
        row.cells.insert(ColumnId::new(3), Datum::Int(9));
        assert_eq!(RowValue::decode(&row.encode()?)?, row);
        Ok(())
    }

    fn datum_key(d: &Datum) -> Bytes {
        index_key(TableId::new(1), IndexId::new(1), std::slice::from_ref(d), false, 0).0
    }

    proptest! {
        #[test]
        fn int_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            let (ka, kb) = (datum_key(&Datum::Int(a)), datum_key(&Datum::Int(b)));
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn string_encoding_preserves_order(a in "[a-z\\x00]{0,20}", b in "[a-z\\x00]{0,20}") {
            let (ka, kb) = (datum_key(&Datum::from(a.as_str())), datum_key(&Datum::from(b.as_str())));
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
        }
    }
}
