//! In-process owner election for tests.
//!
//! Nodes sharing one [`MemoryOwnerElector`] behave like a cluster with a
//! perfect lease service. Not suitable across processes.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::id::NodeId;
use ulid::Ulid;

use super::{CampaignResult, OwnerElector, RenewalResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Lease {
    owner: NodeId,
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory owner elector.
#[derive(Debug)]
pub struct MemoryOwnerElector {
    lease: RwLock<Option<Lease>>,
    lease_duration: Duration,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl MemoryOwnerElector {
    /// Creates an elector granting leases of `lease_duration`.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            lease: RwLock::new(None),
            lease_duration,
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_duration)
            .unwrap_or(chrono::Duration::seconds(3))
    }

    /// Drops the current lease regardless of holder, as if it expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn expire(&self) -> Result<()> {
        *self.lease.write().map_err(poison_err)? = None;
        Ok(())
    }
}

#[async_trait]
impl OwnerElector for MemoryOwnerElector {
    async fn campaign(&self, node: NodeId) -> Result<CampaignResult> {
        let mut lease = self.lease.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(current) = lease.as_ref() {
            if current.expires_at > now && current.owner != node {
                return Ok(CampaignResult::NotOwner {
                    current_owner: Some(current.owner),
                });
            }
        }

        let token = Ulid::new().to_string();
        *lease = Some(Lease {
            owner: node,
            token: token.clone(),
            expires_at: self.expiry(now),
        });
        drop(lease);

        Ok(CampaignResult::Acquired {
            token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, node: NodeId, token: &str) -> Result<RenewalResult> {
        let mut lease = self.lease.write().map_err(poison_err)?;
        let now = Utc::now();
        let Some(current) = lease.as_mut() else {
            return Ok(RenewalResult::Lost);
        };
        if current.owner != node || current.token != token || current.expires_at <= now {
            return Ok(RenewalResult::Lost);
        }
        current.expires_at = self.expiry(now);
        drop(lease);

        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn resign(&self, node: NodeId, token: &str) -> Result<bool> {
        let mut lease = self.lease.write().map_err(poison_err)?;
        let held = lease
            .as_ref()
            .is_some_and(|l| l.owner == node && l.token == token);
        if held {
            *lease = None;
        }
        Ok(held)
    }

    async fn current_owner(&self) -> Result<Option<NodeId>> {
        let lease = self.lease.read().map_err(poison_err)?;
        let now = Utc::now();
        Ok(lease
            .as_ref()
            .filter(|l| l.expires_at > now)
            .map(|l| l.owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_node_owns_at_a_time() -> Result<()> {
        let elector = MemoryOwnerElector::new(Duration::from_secs(30));
        let (a, b) = (NodeId::generate(), NodeId::generate());

        assert!(elector.campaign(a).await?.is_owner());
        assert_eq!(
            elector.campaign(b).await?,
            CampaignResult::NotOwner {
                current_owner: Some(a)
            }
        );
        assert_eq!(elector.current_owner().await?, Some(a));
        Ok(())
    }

    #[tokio::test]
    async fn resign_hands_over() -> Result<()> {
        let elector = MemoryOwnerElector::new(Duration::from_secs(30));
        let (a, b) = (NodeId::generate(), NodeId::generate());
        let CampaignResult::Acquired { token, .. } = elector.campaign(a).await? else {
            panic!("expected ownership");
        };
        assert!(elector.renew(a, &token).await?.is_renewed());
        assert!(!elector.renew(b, &token).await?.is_renewed());
        assert!(elector.resign(a, &token).await?);
        assert!(elector.campaign(b).await?.is_owner());
        assert_eq!(elector.renew(a, &token).await?, RenewalResult::Lost);
        Ok(())
    }

    #[tokio::test]
    async fn expired_leases_can_be_taken_over() -> Result<()> {
        let elector = MemoryOwnerElector::new(Duration::from_millis(20));
        let (a, b) = (NodeId::generate(), NodeId::generate());
        assert!(elector.campaign(a).await?.is_owner());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(elector.campaign(b).await?.is_owner());
        Ok(())
    }
}
