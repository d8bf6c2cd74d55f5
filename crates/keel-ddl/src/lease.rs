//! Schema leases and cluster convergence.
//!
//! Every serving node keeps a lease record `lease/{node_id}` holding the
//! schema version it has loaded and when its lease expires. A node renews the
//! record only after loading the latest version, and stops serving statements
//! once its own lease lapses. That gives the owner a bounded wait: after
//! publishing version `v` it proceeds as soon as every live node reports
//! `v`, or after one lease TTL, by which time any node still behind has
//! fenced itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use keel_core::id::NodeId;
use keel_core::kv::{KeyRange, Transaction, TxnStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics::DdlMetrics;

/// One node's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Node holding the lease.
    pub node_id: NodeId,
    /// Schema version the node has loaded.
    pub observed_version: u64,
    /// Expiry (unix milliseconds).
    pub expires_at: i64,
}

impl LeaseRecord {
    /// Returns true if the lease has not expired at `now_ms`.
    #[must_use]
    pub const fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Outcome of waiting for a version to spread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// Every live node has loaded the version.
    AllSynced,
    /// The wait hit its bound; these nodes were still behind and will have
    /// fenced themselves.
    LeaseElapsed {
        /// Nodes that had not caught up.
        lagging: Vec<NodeId>,
    },
}

impl Convergence {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::AllSynced => "synced",
            Self::LeaseElapsed { .. } => "lease_elapsed",
        }
    }
}

/// Reads and writes lease records.
#[derive(Clone)]
pub struct SchemaSyncer {
    store: Arc<dyn TxnStore>,
    config: LeaseConfig,
    metrics: DdlMetrics,
}

impl std::fmt::Debug for SchemaSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaSyncer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SchemaSyncer {
    /// Creates a syncer.
    #[must_use]
    pub fn new(store: Arc<dyn TxnStore>, config: LeaseConfig) -> Self {
        Self {
            store,
            config,
            metrics: DdlMetrics::new(),
        }
    }

    /// Lease settings.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.config.ttl_ms).unwrap_or(i64::MAX)
    }

    /// Records that `node` has loaded `version`, extending its lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn publish_lease(&self, node: NodeId, version: u64) -> Result<LeaseRecord> {
        let record = LeaseRecord {
            node_id: node,
            observed_version: version,
            expires_at: Utc::now().timestamp_millis().saturating_add(self.ttl_ms()),
        };
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        txn.put_json(keys::lease(node), &record)?;
        txn.commit().await?;
        Ok(record)
    }

    /// Deletes `node`'s lease on clean shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn remove_lease(&self, node: NodeId) -> Result<()> {
        let mut txn = Transaction::begin(Arc::clone(&self.store)).await?;
        txn.delete(keys::lease(node));
        txn.commit().await?;
        Ok(())
    }

    /// Leases that have not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or decode fails.
    pub async fn live_leases(&self) -> Result<Vec<LeaseRecord>> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let pairs = txn
            .scan_all(&KeyRange::prefix(keys::LEASE_PREFIX.as_bytes()))
            .await?;
        let now = Utc::now().timestamp_millis();
        let mut live = Vec::with_capacity(pairs.len());
        for (_, raw) in pairs {
            let record: LeaseRecord = serde_json::from_slice(&raw).map_err(Error::from)?;
            if record.is_live(now) {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Lowest version any live node may still be using.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn min_live_version(&self) -> Result<Option<u64>> {
        Ok(self
            .live_leases()
            .await?
            .iter()
            .map(|r| r.observed_version)
            .min())
    }

    /// Waits until every live node has loaded `version`, or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns an error if reading leases fails.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_convergence(&self, version: u64, timeout: Duration) -> Result<Convergence> {
        let started = Instant::now();
        loop {
            let lagging: Vec<NodeId> = self
                .live_leases()
                .await?
                .into_iter()
                .filter(|r| r.observed_version < version)
                .map(|r| r.node_id)
                .collect();

            let outcome = if lagging.is_empty() {
                Some(Convergence::AllSynced)
            } else if started.elapsed() >= timeout {
                warn!(?lagging, "proceeding without lagging nodes; their leases bound staleness");
                Some(Convergence::LeaseElapsed { lagging })
            } else {
                None
            };
            if let Some(outcome) = outcome {
                self.metrics
                    .observe_convergence_wait(outcome.as_label(), started.elapsed());
                debug!(outcome = outcome.as_label(), "schema version converged");
                return Ok(outcome);
            }
            tokio::time::sleep(self.config.convergence_poll()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_core::kv::MemoryStore;

    use super::*;

    fn syncer(ttl_ms: u64) -> SchemaSyncer {
        SchemaSyncer::new(
            MemoryStore::shared(),
            LeaseConfig {
                ttl_ms,
                refresh_interval_ms: ttl_ms / 4,
                convergence_poll_ms: 5,
            },
        )
    }

    #[tokio::test]
    async fn converges_once_every_node_reports() -> Result<()> {
        let syncer = syncer(5_000);
        let (a, b) = (NodeId::generate(), NodeId::generate());
        syncer.publish_lease(a, 3).await?;
        syncer.publish_lease(b, 2).await?;

        let waiter = {
            let syncer = syncer.clone();
            tokio::spawn(async move { syncer.wait_for_convergence(3, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        syncer.publish_lease(b, 3).await?;

        let outcome = waiter.await.map_err(|e| Error::internal(e.to_string()))??;
        assert_eq!(outcome, Convergence::AllSynced);
        assert_eq!(syncer.min_live_version().await?, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn lagging_nodes_are_reported_after_the_bound() -> Result<()> {
        let syncer = syncer(5_000);
        let slow = NodeId::generate();
        syncer.publish_lease(slow, 1).await?;
        let outcome = syncer
            .wait_for_convergence(2, Duration::from_millis(30))
            .await?;
        assert_eq!(outcome, Convergence::LeaseElapsed { lagging: vec![slow] });
        Ok(())
    }

    #[tokio::test]
    async fn expired_and_removed_leases_are_ignored() -> Result<()> {
        let syncer = syncer(20);
        let (gone, left) = (NodeId::generate(), NodeId::generate());
        syncer.publish_lease(gone, 1).await?;
        syncer.publish_lease(left, 1).await?;
        syncer.remove_lease(left).await?;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(syncer.live_leases().await?.is_empty());
        assert_eq!(
            syncer.wait_for_convergence(9, Duration::from_secs(1)).await?,
            Convergence::AllSynced
        );
        Ok(())
    }
}
