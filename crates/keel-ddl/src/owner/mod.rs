//! DDL owner election.
//!
//! Exactly one node drives DDL jobs at a time. The [`OwnerElector`] trait
//! hands out time-bounded leases; the holder renews before expiry or loses
//! ownership, and a peer takes over within one lease interval of a crash.
//!
//! Ownership is threaded through the scheduler as an explicit [`OwnerLease`]
//! handle rather than process-wide state, so several logical clusters can run
//! in one process.
//!
//! Backends:
//!
//! - [`memory::MemoryOwnerElector`]: shared in-process state, for tests.
//! - [`store::StoreOwnerElector`]: lease record kept in the transactional store.

pub mod memory;
pub mod store;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::id::NodeId;

use crate::error::{Error, Result};

/// Result of an ownership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignResult {
    /// This node is the owner.
    Acquired {
        /// Token required for renewal and release.
        token: String,
        /// Time until the lease expires.
        lease_duration: Duration,
    },
    /// Another node owns the lease.
    NotOwner {
        /// The current owner, if known.
        current_owner: Option<NodeId>,
    },
}

impl CampaignResult {
    /// Returns true if ownership was acquired.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Result of a renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// The lease was extended.
    Renewed {
        /// New time until expiry.
        lease_duration: Duration,
    },
    /// The lease expired or was taken over.
    Lost,
}

impl RenewalResult {
    /// Returns true if the lease was renewed.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Owner election backend.
#[async_trait]
pub trait OwnerElector: Send + Sync + 'static {
    /// Tries to become (or stay) the owner.
    async fn campaign(&self, node: NodeId) -> Result<CampaignResult>;

    /// Extends a held lease.
    async fn renew(&self, node: NodeId, token: &str) -> Result<RenewalResult>;

    /// Gives up a held lease. Returns false if it was no longer held.
    async fn resign(&self, node: NodeId, token: &str) -> Result<bool>;

    /// Returns the current owner, if any.
    async fn current_owner(&self) -> Result<Option<NodeId>>;
}

#[derive(Debug)]
struct HeldLease {
    token: String,
    valid_until: Instant,
}

/// This node's view of its ownership.
///
/// Cheap to clone; all clones share state. Validity is judged against the
/// local monotonic clock with the lease shortened by a safety margin, so a
/// node stops acting before a peer can take over.
#[derive(Debug, Clone, Default)]
pub struct OwnerLease {
    inner: Arc<RwLock<Option<HeldLease>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("owner lease lock poisoned")
}

impl OwnerLease {
    /// Creates a handle that holds nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a granted or renewed lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn grant(&self, token: String, lease_duration: Duration) -> Result<()> {
        let valid_until = Instant::now() + lease_duration.mul_f64(0.8);
        *self.inner.write().map_err(poison_err)? = Some(HeldLease { token, valid_until });
        Ok(())
    }

    /// Extends the current lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn extend(&self, lease_duration: Duration) -> Result<()> {
        if let Some(held) = self.inner.write().map_err(poison_err)?.as_mut() {
            held.valid_until = Instant::now() + lease_duration.mul_f64(0.8);
        }
        Ok(())
    }

    /// Forgets the lease.
    pub fn revoke(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }

    /// The token of the held lease.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.token.clone()))
    }

    /// Returns true while the lease is held and unexpired.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.valid_until > Instant::now()))
            .unwrap_or(false)
    }

    /// Fails with [`Error::OwnerLost`] unless the lease is valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnerLost`].
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::OwnerLost)
        }
    }
}
