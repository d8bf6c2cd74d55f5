//! Fault injection for the transactional store.
//!
//! [`FaultyStore`] wraps any [`TxnStore`] and fails a share of commits (and,
//! optionally, reads) with a transient storage error before they reach the
//! inner store. Failures are drawn from a seeded RNG so a failing run can be
//! replayed with the same seed.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_core::kv::MemoryStore;
//! use keel_test_utils::simulation::{FaultConfig, FaultyStore};
//!
//! let store = FaultyStore::new(MemoryStore::shared(), 42);
//! store.configure(FaultConfig::flaky_commits(0.2).touching("ddl/queue/"));
//! store.fail_next_commits("ddl/reorg/", 3);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use keel_core::error::{Error, Result};
use keel_core::kv::{CommitInfo, KeyRange, Mutation, Timestamp, TxnStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Configuration for probabilistic faults.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability a commit fails (0.0 - 1.0).
    pub commit_failure_rate: f64,

    /// Probability a point read or scan fails (0.0 - 1.0).
    pub read_failure_rate: f64,

    /// Restricts commit faults to transactions writing a key with this
    /// prefix. Lease renewals and unrelated writes pass through untouched.
    pub key_prefix: Option<String>,
}

impl FaultConfig {
    /// Creates a config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fails commits with probability `rate`.
    #[must_use]
    pub fn flaky_commits(rate: f64) -> Self {
        Self {
            commit_failure_rate: rate,
            ..Default::default()
        }
    }

    /// Restricts commit faults to writes under `prefix`.
    #[must_use]
    pub fn touching(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn applies_to(&self, mutations: &[Mutation]) -> bool {
        self.key_prefix
            .as_deref()
            .map_or(true, |prefix| touches(mutations, prefix))
    }
}

fn touches(mutations: &[Mutation], prefix: &str) -> bool {
    mutations
        .iter()
        .any(|m| m.key().starts_with(prefix.as_bytes()))
}

#[derive(Debug, Default)]
struct Forced {
    prefix: String,
    remaining: u32,
}

/// A [`TxnStore`] that injects transient failures.
pub struct FaultyStore {
    inner: Arc<dyn TxnStore>,
    rng: Mutex<StdRng>,
    config: Mutex<FaultConfig>,
    forced: Mutex<Forced>,
    injected: AtomicU64,
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore")
            .field("injected", &self.injected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FaultyStore {
    /// Wraps `inner` with faults drawn from an RNG seeded with `seed`.
    /// No faults fire until configured.
    pub fn new(inner: Arc<dyn TxnStore>, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            config: Mutex::new(FaultConfig::no_faults()),
            forced: Mutex::new(Forced::default()),
            injected: AtomicU64::new(0),
        })
    }

    /// Replaces the fault configuration.
    pub fn configure(&self, config: FaultConfig) {
        *self.config.lock().expect("lock poisoned") = config;
    }

    /// Fails the next `count` commits writing any key under `prefix`,
    /// regardless of the configured rate.
    pub fn fail_next_commits(&self, prefix: impl Into<String>, count: u32) {
        *self.forced.lock().expect("lock poisoned") = Forced {
            prefix: prefix.into(),
            remaining: count,
        };
    }

    /// Forced failures not yet consumed.
    pub fn forced_remaining(&self) -> u32 {
        self.forced.lock().expect("lock poisoned").remaining
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Returns this store as the trait object nodes take.
    pub fn as_store(self: &Arc<Self>) -> Arc<dyn TxnStore> {
        Arc::clone(self) as Arc<dyn TxnStore>
    }

    fn roll(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().expect("lock poisoned").gen_bool(rate.min(1.0))
    }

    fn should_fail_commit(&self, mutations: &[Mutation]) -> bool {
        {
            let mut forced = self.forced.lock().expect("lock poisoned");
            if forced.remaining > 0 && touches(mutations, &forced.prefix) {
                forced.remaining -= 1;
                return true;
            }
        }
        let config = self.config.lock().expect("lock poisoned").clone();
        config.applies_to(mutations) && self.roll(config.commit_failure_rate)
    }

    fn should_fail_read(&self) -> bool {
        let rate = self.config.lock().expect("lock poisoned").read_failure_rate;
        self.roll(rate)
    }

    fn injected(&self, what: &str) -> Error {
        let n = self.injected.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(what, n, "injecting storage fault");
        Error::storage(format!("injected {what} failure"))
    }
}

#[async_trait]
impl TxnStore for FaultyStore {
    async fn current_ts(&self) -> Result<Timestamp> {
        self.inner.current_ts().await
    }

    async fn get_at(&self, key: &[u8], ts: Timestamp) -> Result<Option<Bytes>> {
        if self.should_fail_read() {
            return Err(self.injected("read"));
        }
        self.inner.get_at(key, ts).await
    }

    async fn scan_at(
        &self,
        range: &KeyRange,
        ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>> {
        if self.should_fail_read() {
            return Err(self.injected("scan"));
        }
        self.inner.scan_at(range, ts, limit).await
    }

    async fn commit(&self, start_ts: Timestamp, mutations: Vec<Mutation>) -> Result<CommitInfo> {
        if self.should_fail_commit(&mutations) {
            return Err(self.injected("commit"));
        }
        self.inner.commit(start_ts, mutations).await
    }
}

#[cfg(test)]
mod tests {
    use keel_core::kv::{MemoryStore, Transaction};

    use super::*;

    async fn write(store: Arc<dyn TxnStore>, key: &str) -> Result<CommitInfo> {
        let mut txn = Transaction::begin(store).await?;
        txn.put(key.as_bytes().to_vec(), b"v".to_vec());
        txn.commit().await
    }

    #[tokio::test]
    async fn forced_failures_only_hit_matching_keys() -> Result<()> {
        let store = FaultyStore::new(MemoryStore::shared(), 7);
        store.fail_next_commits("ddl/", 2);

        write(store.as_store(), "lease/a").await?;
        assert!(write(store.as_store(), "ddl/queue/1").await.is_err());
        let err = write(store.as_store(), "ddl/queue/1").await.unwrap_err();
        assert!(err.is_retryable());
        write(store.as_store(), "ddl/queue/1").await?;

        assert_eq!(store.injected_failures(), 2);
        assert_eq!(store.forced_remaining(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_commits_write_nothing() -> Result<()> {
        let store = FaultyStore::new(MemoryStore::shared(), 7);
        store.configure(FaultConfig::flaky_commits(1.0));
        assert!(write(store.as_store(), "k").await.is_err());

        store.configure(FaultConfig::no_faults());
        let txn = Transaction::begin(store.as_store()).await?;
        assert!(txn.get(b"k").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn same_seed_same_faults() -> Result<()> {
        async fn outcomes(seed: u64) -> Vec<bool> {
            let store = FaultyStore::new(MemoryStore::shared(), seed);
            store.configure(FaultConfig::flaky_commits(0.5));
            let mut out = Vec::new();
            for n in 0..32 {
                out.push(write(store.as_store(), &format!("k{n}")).await.is_ok());
            }
            out
        }
        assert_eq!(outcomes(99).await, outcomes(99).await);
        Ok(())
    }
}
