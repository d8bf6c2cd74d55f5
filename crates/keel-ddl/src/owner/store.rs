//! Owner election backed by the transactional store.
//!
//! The lease lives under [`keys::OWNER`]. Acquisition and renewal are
//! read-modify-write transactions, so two candidates racing for an expired
//! lease are serialized by the store's first-committer-wins rule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::id::NodeId;
use keel_core::kv::{Transaction, TxnStore};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{CampaignResult, OwnerElector, RenewalResult};
use crate::error::{Error, Result};
use crate::keys;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnerRecord {
    owner: NodeId,
    token: String,
    /// Unix milliseconds.
    expires_at: i64,
}

impl OwnerRecord {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Owner elector persisting its lease in a [`TxnStore`].
pub struct StoreOwnerElector {
    store: Arc<dyn TxnStore>,
    lease_duration: Duration,
}

impl std::fmt::Debug for StoreOwnerElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOwnerElector")
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

impl StoreOwnerElector {
    /// Creates an elector over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TxnStore>, lease_duration: Duration) -> Self {
        Self {
            store,
            lease_duration,
        }
    }

    fn lease_ms(&self) -> i64 {
        i64::try_from(self.lease_duration.as_millis()).unwrap_or(i64::MAX)
    }

    async fn read(&self) -> Result<(Transaction, Option<OwnerRecord>)> {
        let txn = Transaction::begin(Arc::clone(&self.store)).await?;
        let record = txn.get_json::<OwnerRecord>(keys::OWNER.as_bytes()).await?;
        Ok((txn, record))
    }
}

#[async_trait]
impl OwnerElector for StoreOwnerElector {
    async fn campaign(&self, node: NodeId) -> Result<CampaignResult> {
        let (mut txn, record) = self.read().await?;
        let now = Utc::now().timestamp_millis();
        if let Some(current) = &record {
            if current.is_live(now) && current.owner != node {
                return Ok(CampaignResult::NotOwner {
                    current_owner: Some(current.owner),
                });
            }
        }

        let token = Ulid::new().to_string();
        txn.put_json(
            keys::OWNER,
            &OwnerRecord {
                owner: node,
                token: token.clone(),
                expires_at: now.saturating_add(self.lease_ms()),
            },
        )?;
        match txn.commit().await.map_err(Error::from) {
            Ok(_) => Ok(CampaignResult::Acquired {
                token,
                lease_duration: self.lease_duration,
            }),
            Err(e) if e.is_write_conflict() => Ok(CampaignResult::NotOwner {
                current_owner: None,
            }),
            Err(e) => Err(e),
        }
    }

    async fn renew(&self, node: NodeId, token: &str) -> Result<RenewalResult> {
        let (mut txn, record) = self.read().await?;
        let now = Utc::now().timestamp_millis();
        let Some(mut current) = record else {
            return Ok(RenewalResult::Lost);
        };
        if current.owner != node || current.token != token || !current.is_live(now) {
            return Ok(RenewalResult::Lost);
        }
        current.expires_at = now.saturating_add(self.lease_ms());
        txn.put_json(keys::OWNER, &current)?;
        match txn.commit().await.map_err(Error::from) {
            Ok(_) => Ok(RenewalResult::Renewed {
                lease_duration: self.lease_duration,
            }),
            Err(e) if e.is_write_conflict() => Ok(RenewalResult::Lost),
            Err(e) => Err(e),
        }
    }

    async fn resign(&self, node: NodeId, token: &str) -> Result<bool> {
        let (mut txn, record) = self.read().await?;
        match record {
            Some(current) if current.owner == node && current.token == token => {
                txn.delete(keys::OWNER);
                txn.commit().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_owner(&self) -> Result<Option<NodeId>> {
        let (_, record) = self.read().await?;
        let now = Utc::now().timestamp_millis();
        Ok(record.filter(|r| r.is_live(now)).map(|r| r.owner))
    }
}

#[cfg(test)]
mod tests {
    use keel_core::kv::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn store_lease_excludes_other_nodes() -> Result<()> {
        let store = MemoryStore::shared();
        let a_side = StoreOwnerElector::new(Arc::clone(&store), Duration::from_secs(30));
        let b_side = StoreOwnerElector::new(store, Duration::from_secs(30));
        let (a, b) = (NodeId::generate(), NodeId::generate());

        let CampaignResult::Acquired { token, .. } = a_side.campaign(a).await? else {
            panic!("expected ownership");
        };
        assert!(!b_side.campaign(b).await?.is_owner());
        assert_eq!(b_side.current_owner().await?, Some(a));
        assert!(a_side.renew(a, &token).await?.is_renewed());

        assert!(a_side.resign(a, &token).await?);
        assert!(b_side.campaign(b).await?.is_owner());
        assert_eq!(a_side.renew(a, &token).await?, RenewalResult::Lost);
        Ok(())
    }

    #[tokio::test]
    async fn expired_store_lease_is_taken_over() -> Result<()> {
        let store = MemoryStore::shared();
        let elector = StoreOwnerElector::new(store, Duration::from_millis(20));
        let (a, b) = (NodeId::generate(), NodeId::generate());
        assert!(elector.campaign(a).await?.is_owner());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(elector.current_owner().await?, None);
        assert!(elector.campaign(b).await?.is_owner());
        Ok(())
    }
}
