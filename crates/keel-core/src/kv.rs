//! Transactional key-value capability.
//!
//! keel treats storage as a linearizable, multi-versioned key-value store with
//! snapshot isolation. [`TxnStore`] is the narrow contract a storage engine
//! supplies; everything above it (schema metadata, the DDL queue, table rows and
//! index entries) is expressed as keys in one ordered keyspace.
//!
//! ## Semantics
//!
//! - Every commit is stamped with a timestamp from a single monotonic clock.
//! - Reads at timestamp `ts` observe exactly the versions committed at or
//!   before `ts`.
//! - A transaction started at `start_ts` fails with
//!   [`Error::WriteConflict`] when any key it writes has a version committed
//!   after `start_ts` (first committer wins).
//! - [`Mutation::PutIfUnchanged`] is a conditional write: it is silently
//!   skipped when the key, or one of its guard keys, changed after `since`.
//!   Backfill uses it so that foreground writes newer than the backfill
//!   snapshot always win.
//! - [`Mutation::AssertUnchanged`] writes nothing but fails the commit when
//!   the key changed after `since`.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! single-process deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Logical commit timestamp.
pub type Timestamp = u64;

/// A half-open key range `[start, end)`. An empty `end` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Bytes,
    /// Exclusive upper bound; empty means no upper bound.
    pub end: Bytes,
}

impl KeyRange {
    /// Creates a range from explicit bounds.
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Creates the range covering every key that starts with `prefix`.
    #[must_use]
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Bytes::copy_from_slice(prefix),
            end: prefix_end(prefix),
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && (self.end.is_empty() || key < self.end.as_ref())
    }

    /// Returns a copy of this range starting at `start` instead.
    #[must_use]
    pub fn with_start(&self, start: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: self.end.clone(),
        }
    }

    fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let end = if self.end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(self.end.as_ref())
        };
        (Bound::Included(self.start.as_ref()), end)
    }
}

/// Returns the smallest key greater than every key with the given prefix.
///
/// Returns an empty (unbounded) key when the prefix is all `0xFF`.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Bytes::from(end);
        }
    }
    Bytes::new()
}

/// Returns the immediate successor of `key` in byte order.
#[must_use]
pub fn key_successor(key: &[u8]) -> Bytes {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    Bytes::from(next)
}

/// Renders a key for logs and error messages.
#[must_use]
pub fn display_key(key: &[u8]) -> String {
    key.escape_ascii().to_string()
}

/// A single write in a commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Unconditionally writes a value.
    Put {
        /// Target key.
        key: Bytes,
        /// New value.
        value: Bytes,
    },
    /// Writes a tombstone.
    Delete {
        /// Target key.
        key: Bytes,
    },
    /// Writes a value only if neither `key` nor any of `guards` has a version
    /// committed after `since`; otherwise the write is skipped.
    PutIfUnchanged {
        /// Target key.
        key: Bytes,
        /// New value.
        value: Bytes,
        /// Additional keys whose newer versions also suppress the write.
        guards: Vec<Bytes>,
        /// Snapshot timestamp the value was derived from.
        since: Timestamp,
    },
    /// Fails the commit if `key` has a version committed after `since`.
    AssertUnchanged {
        /// Guarded key.
        key: Bytes,
        /// Timestamp at which the key was last observed.
        since: Timestamp,
    },
}

impl Mutation {
    /// Returns the key this mutation targets.
    #[must_use]
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Put { key, .. }
            | Self::Delete { key }
            | Self::PutIfUnchanged { key, .. }
            | Self::AssertUnchanged { key, .. } => key,
        }
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    /// Timestamp the batch was committed at.
    pub commit_ts: Timestamp,
    /// Keys of conditional writes that were skipped.
    pub skipped: Vec<Bytes>,
}

/// The storage capability keel runs on.
#[async_trait]
pub trait TxnStore: Send + Sync + 'static {
    /// Returns the timestamp of the latest commit. A read at this timestamp
    /// observes every committed write.
    async fn current_ts(&self) -> Result<Timestamp>;

    /// Reads the value of `key` visible at `ts`.
    async fn get_at(&self, key: &[u8], ts: Timestamp) -> Result<Option<Bytes>>;

    /// Returns up to `limit` live key/value pairs in `range`, in key order, as
    /// of `ts`.
    async fn scan_at(
        &self,
        range: &KeyRange,
        ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>>;

    /// Atomically applies `mutations` for a transaction that started at
    /// `start_ts`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteConflict`] if a written or asserted key changed
    /// after the transaction's start (or the assertion's `since`).
    async fn commit(&self, start_ts: Timestamp, mutations: Vec<Mutation>) -> Result<CommitInfo>;
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put(Bytes),
    Delete,
    PutIfUnchanged {
        value: Bytes,
        guards: Vec<Bytes>,
        since: Timestamp,
    },
}

impl PendingWrite {
    fn visible_value(&self) -> Option<Bytes> {
        match self {
            Self::Put(value) | Self::PutIfUnchanged { value, .. } => Some(value.clone()),
            Self::Delete => None,
        }
    }
}

/// An optimistic snapshot-isolation transaction.
///
/// Reads see the snapshot at the start timestamp plus the transaction's own
/// buffered writes. Writes are buffered locally and applied atomically by
/// [`Transaction::commit`].
pub struct Transaction {
    store: Arc<dyn TxnStore>,
    start_ts: Timestamp,
    writes: BTreeMap<Bytes, PendingWrite>,
    asserts: BTreeMap<Bytes, Timestamp>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ts", &self.start_ts)
            .field("writes", &self.writes.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Begins a transaction at the store's current timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report its timestamp.
    pub async fn begin(store: Arc<dyn TxnStore>) -> Result<Self> {
        let start_ts = store.current_ts().await?;
        Ok(Self {
            store,
            start_ts,
            writes: BTreeMap::new(),
            asserts: BTreeMap::new(),
        })
    }

    /// Returns the snapshot timestamp reads are served at.
    #[must_use]
    pub const fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Returns true if the transaction has buffered writes or assertions.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty() || !self.asserts.is_empty()
    }

    /// Reads a key, observing this transaction's own writes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.visible_value());
        }
        self.store.get_at(key, self.start_ts).await
    }

    /// Reads and decodes a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the value does not decode.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Scans up to `limit` live pairs in `range`, merging buffered writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying scan fails.
    pub async fn scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        let (lo, hi) = range.bounds();
        let local: Vec<_> = self
            .writes
            .range::<[u8], _>((lo, hi))
            .map(|(k, w)| (k.clone(), w.visible_value()))
            .collect();
        let fetched = self
            .store
            .scan_at(range, self.start_ts, limit.saturating_add(local.len()))
            .await?;

        let mut merged: BTreeMap<Bytes, Bytes> = fetched.into_iter().collect();
        for (key, value) in local {
            match value {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_iter().take(limit).collect())
    }

    /// Scans every live pair in `range`, paging through the store.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails.
    pub async fn scan_all(&self, range: &KeyRange) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        let mut cursor = range.clone();
        loop {
            let page = self.scan(&cursor, SCAN_PAGE).await?;
            let full = page.len() == SCAN_PAGE;
            if let Some((last, _)) = page.last() {
                cursor = cursor.with_start(key_successor(last));
            }
            out.extend(page);
            if !full {
                return Ok(out);
            }
        }
    }

    /// Buffers an unconditional write.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.writes
            .insert(key.into(), PendingWrite::Put(value.into()));
    }

    /// Encodes `value` as JSON and buffers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<Bytes>, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.put(key, raw);
        Ok(())
    }

    /// Buffers a delete.
    pub fn delete(&mut self, key: impl Into<Bytes>) {
        self.writes.insert(key.into(), PendingWrite::Delete);
    }

    /// Buffers a conditional write; see [`Mutation::PutIfUnchanged`].
    pub fn put_if_unchanged(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        guards: Vec<Bytes>,
        since: Timestamp,
    ) {
        self.writes.insert(
            key.into(),
            PendingWrite::PutIfUnchanged {
                value: value.into(),
                guards,
                since,
            },
        );
    }

    /// Fails the commit if `key` changes after `since`.
    pub fn assert_unchanged(&mut self, key: impl Into<Bytes>, since: Timestamp) {
        let key = key.into();
        let entry = self.asserts.entry(key).or_insert(since);
        *entry = (*entry).min(since);
    }

    /// Commits buffered writes atomically.
    ///
    /// A transaction without writes commits trivially at its start timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteConflict`] if a newer commit touched a written
    /// key, or a storage error from the backend.
    pub async fn commit(self) -> Result<CommitInfo> {
        if !self.is_dirty() {
            return Ok(CommitInfo {
                commit_ts: self.start_ts,
                skipped: Vec::new(),
            });
        }
        let mut mutations: Vec<Mutation> = self
            .asserts
            .into_iter()
            .map(|(key, since)| Mutation::AssertUnchanged { key, since })
            .collect();
        mutations.extend(self.writes.into_iter().map(|(key, write)| match write {
            PendingWrite::Put(value) => Mutation::Put { key, value },
            PendingWrite::Delete => Mutation::Delete { key },
            PendingWrite::PutIfUnchanged {
                value,
                guards,
                since,
            } => Mutation::PutIfUnchanged {
                key,
                value,
                guards,
                since,
            },
        }));
        self.store.commit(self.start_ts, mutations).await
    }
}

const SCAN_PAGE: usize = 512;

/// A read-only view of the store at a fixed timestamp.
#[derive(Clone)]
pub struct Snapshot {
    store: Arc<dyn TxnStore>,
    ts: Timestamp,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("ts", &self.ts).finish()
    }
}

impl Snapshot {
    /// Creates a snapshot at an explicit timestamp.
    #[must_use]
    pub fn at(store: Arc<dyn TxnStore>, ts: Timestamp) -> Self {
        Self { store, ts }
    }

    /// Creates a snapshot at the store's current timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report its timestamp.
    pub async fn latest(store: Arc<dyn TxnStore>) -> Result<Self> {
        let ts = store.current_ts().await?;
        Ok(Self { store, ts })
    }

    /// Returns the snapshot timestamp.
    #[must_use]
    pub const fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.store.get_at(key, self.ts).await
    }

    /// Reads and decodes a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the value does not decode.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Scans up to `limit` pairs in `range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<(Bytes, Bytes)>> {
        self.store.scan_at(range, self.ts, limit).await
    }

    /// Scans every pair in `range`, paging through the store.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails.
    pub async fn scan_all(&self, range: &KeyRange) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        let mut cursor = range.clone();
        loop {
            let page = self.scan(&cursor, SCAN_PAGE).await?;
            let full = page.len() == SCAN_PAGE;
            if let Some((last, _)) = page.last() {
                cursor = cursor.with_start(key_successor(last));
            }
            out.extend(page);
            if !full {
                return Ok(out);
            }
        }
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[derive(Debug, Clone)]
struct Version {
    commit_ts: Timestamp,
    value: Option<Bytes>,
}

#[derive(Debug, Default)]
struct MvccState {
    versions: BTreeMap<Bytes, Vec<Version>>,
    last_ts: Timestamp,
}

impl MvccState {
    fn latest_commit_ts(&self, key: &[u8]) -> Option<Timestamp> {
        self.versions
            .get(key)
            .and_then(|chain| chain.last())
            .map(|v| v.commit_ts)
    }

    fn changed_since(&self, key: &[u8], since: Timestamp) -> Option<Timestamp> {
        self.latest_commit_ts(key).filter(|ts| *ts > since)
    }

    fn visible(chain: &[Version], ts: Timestamp) -> Option<&Bytes> {
        chain
            .iter()
            .rev()
            .find(|v| v.commit_ts <= ts)
            .and_then(|v| v.value.as_ref())
    }
}

/// In-memory multi-version store.
///
/// Keeps every committed version; suitable for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MvccState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store behind the shared trait object keel passes around.
    #[must_use]
    pub fn shared() -> Arc<dyn TxnStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TxnStore for MemoryStore {
    async fn current_ts(&self) -> Result<Timestamp> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.last_ts)
    }

    async fn get_at(&self, key: &[u8], ts: Timestamp) -> Result<Option<Bytes>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .versions
            .get(key)
            .and_then(|chain| MvccState::visible(chain, ts))
            .cloned())
    }

    async fn scan_at(
        &self,
        range: &KeyRange,
        ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .versions
            .range::<[u8], _>(range.bounds())
            .filter_map(|(key, chain)| {
                MvccState::visible(chain, ts).map(|value| (key.clone(), value.clone()))
            })
            .take(limit)
            .collect())
    }

    async fn commit(&self, start_ts: Timestamp, mutations: Vec<Mutation>) -> Result<CommitInfo> {
        let mut state = self.state.write().map_err(poison_err)?;

        for mutation in &mutations {
            let since = match mutation {
                Mutation::Put { .. } | Mutation::Delete { .. } => start_ts,
                Mutation::AssertUnchanged { since, .. } => *since,
                Mutation::PutIfUnchanged { .. } => continue,
            };
            if let Some(committed_ts) = state.changed_since(mutation.key(), since) {
                return Err(Error::WriteConflict {
                    key: display_key(mutation.key()),
                    start_ts,
                    committed_ts,
                });
            }
        }

        let commit_ts = state.last_ts + 1;
        let mut skipped = Vec::new();
        for mutation in mutations {
            let (key, value) = match mutation {
                Mutation::Put { key, value } => (key, Some(value)),
                Mutation::Delete { key } => (key, None),
                Mutation::AssertUnchanged { .. } => continue,
                Mutation::PutIfUnchanged {
                    key,
                    value,
                    guards,
                    since,
                } => {
                    let stale = state.changed_since(&key, since).is_some()
                        || guards.iter().any(|g| state.changed_since(g, since).is_some());
                    if stale {
                        skipped.push(key);
                        continue;
                    }
                    (key, Some(value))
                }
            };
            state
                .versions
                .entry(key)
                .or_default()
                .push(Version { commit_ts, value });
        }
        state.last_ts = commit_ts;
        drop(state);

        Ok(CommitInfo { commit_ts, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<dyn TxnStore> {
        MemoryStore::shared()
    }

    #[tokio::test]
    async fn reads_observe_snapshot_not_later_commits() -> Result<()> {
        let store = store();
        let mut txn = Transaction::begin(Arc::clone(&store)).await?;
        txn.put("a", "1");
        txn.commit().await?;

        let reader = Transaction::begin(Arc::clone(&store)).await?;

        let mut writer = Transaction::begin(Arc::clone(&store)).await?;
        writer.put("a", "2");
        writer.commit().await?;

        assert_eq!(reader.get(b"a").await?, Some(Bytes::from("1")));
        let latest = Snapshot::latest(store).await?;
        assert_eq!(latest.get(b"a").await?, Some(Bytes::from("2")));
        Ok(())
    }

    #[tokio::test]
    async fn first_committer_wins() -> Result<()> {
        let store = store();
        let mut first = Transaction::begin(Arc::clone(&store)).await?;
        let mut second = Transaction::begin(Arc::clone(&store)).await?;
        first.put("seq", "1");
        second.put("seq", "1");
        first.commit().await?;

        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, Error::WriteConflict { .. }));
        assert!(err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn own_writes_are_visible_in_scans() -> Result<()> {
        let store = store();
        let mut seed = Transaction::begin(Arc::clone(&store)).await?;
        seed.put("k/1", "a");
        seed.put("k/2", "b");
        seed.put("k/3", "c");
        seed.commit().await?;

        let mut txn = Transaction::begin(store).await?;
        txn.delete("k/1");
        txn.put("k/4", "d");
        let keys: Vec<_> = txn
            .scan(&KeyRange::prefix(b"k/"), 10)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![Bytes::from("k/2"), Bytes::from("k/3"), Bytes::from("k/4")]);

        let limited = txn.scan(&KeyRange::prefix(b"k/"), 2).await?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].0, Bytes::from("k/2"));
        Ok(())
    }

    #[tokio::test]
    async fn conditional_write_loses_to_newer_foreground_write() -> Result<()> {
        let store = store();
        let mut seed = Transaction::begin(Arc::clone(&store)).await?;
        seed.put("row", "v1");
        seed.commit().await?;
        let snapshot_ts = store.current_ts().await?;

        let mut fg = Transaction::begin(Arc::clone(&store)).await?;
        fg.put("row", "v2");
        fg.commit().await?;

        let mut backfill = Transaction::begin(Arc::clone(&store)).await?;
        backfill.put_if_unchanged("row", "stale", Vec::new(), snapshot_ts);
        backfill.put_if_unchanged("idx", "entry", vec![Bytes::from("row")], snapshot_ts);
        let info = backfill.commit().await?;
        assert_eq!(info.skipped.len(), 2);

        let latest = Snapshot::latest(store).await?;
        assert_eq!(latest.get(b"row").await?, Some(Bytes::from("v2")));
        assert_eq!(latest.get(b"idx").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn assert_unchanged_fails_after_concurrent_write() -> Result<()> {
        let store = store();
        let observed = store.current_ts().await?;

        let mut bump = Transaction::begin(Arc::clone(&store)).await?;
        bump.put("m/schema_version", "2");
        bump.commit().await?;

        let mut stmt = Transaction::begin(store).await?;
        stmt.assert_unchanged("m/schema_version", observed);
        stmt.put("t/1", "row");
        assert!(matches!(
            stmt.commit().await,
            Err(Error::WriteConflict { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn deletes_leave_tombstones_visible_to_old_snapshots() -> Result<()> {
        let store = store();
        let mut seed = Transaction::begin(Arc::clone(&store)).await?;
        seed.put("x", "1");
        seed.commit().await?;
        let before = Snapshot::latest(Arc::clone(&store)).await?;

        let mut del = Transaction::begin(Arc::clone(&store)).await?;
        del.delete("x");
        del.commit().await?;

        assert_eq!(before.get(b"x").await?, Some(Bytes::from("1")));
        let after = Snapshot::latest(store).await?;
        assert_eq!(after.get(b"x").await?, None);
        assert!(after.scan(&KeyRange::prefix(b"x"), 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn scan_all_pages_through_large_ranges() -> Result<()> {
        let store = store();
        let mut seed = Transaction::begin(Arc::clone(&store)).await?;
        for i in 0..1200u32 {
            seed.put(format!("p/{i:05}"), "v");
        }
        seed.commit().await?;
        let snap = Snapshot::latest(store).await?;
        assert_eq!(snap.scan_all(&KeyRange::prefix(b"p/")).await?.len(), 1200);
        Ok(())
    }

    #[test]
    fn prefix_end_handles_trailing_ff() {
        assert_eq!(prefix_end(b"ab"), Bytes::from("ac"));
        assert_eq!(prefix_end(&[0x01, 0xFF]), Bytes::from(vec![0x02]));
        assert!(prefix_end(&[0xFF, 0xFF]).is_empty());
    }

    #[test]
    fn key_range_contains_respects_bounds() {
        let range = KeyRange::prefix(b"t1_");
        assert!(range.contains(b"t1_r0"));
        assert!(!range.contains(b"t2_r0"));
        let open = KeyRange::new("m", Bytes::new());
        assert!(open.contains(b"zzz"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prefix_range_contains_every_extension(
                prefix in proptest::collection::vec(any::<u8>(), 1..8),
                suffix in proptest::collection::vec(any::<u8>(), 0..8),
            ) {
                let range = KeyRange::prefix(&prefix);
                let mut key = prefix.clone();
                key.extend_from_slice(&suffix);
                prop_assert!(range.contains(&key));
            }

            #[test]
            fn successor_is_strictly_greater(key in proptest::collection::vec(any::<u8>(), 0..16)) {
                let next = key_successor(&key);
                prop_assert!(next.as_ref() > key.as_slice());
            }
        }
    }
}
