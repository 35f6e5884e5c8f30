//! Leader leases.
//!
//! One lease row exists per worker kind. Whoever holds the unexpired row is
//! the only replica allowed to run that kind's reconciliation passes.
//! Acquisition and renewal are the same single conditional update:
//!
//! ```sql
//! UPDATE leader_leases
//! SET leader_id = :me, expires_at = now() + :duration
//! WHERE lease_type = :kind AND (expires_at <= now() OR leader_id = :me)
//! ```
//!
//! Exactly one row is affected iff the caller already holds the lease or
//! the lease has expired, so concurrent replicas race safely on the row
//! without any other lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kfm_id::{LeaseId, ReplicaId};
use tracing::{debug, warn};

use crate::db::DbError;

/// A lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub lease_type: String,
    /// Last replica to hold the lease. `None` until first acquired.
    pub leader_id: Option<ReplicaId>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease whose expiry has passed is available to anyone.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if `replica` holds the lease at `now`.
    pub fn is_held_by(&self, replica: &ReplicaId, now: DateTime<Utc>) -> bool {
        !self.is_available(now) && self.leader_id.as_ref() == Some(replica)
    }
}

/// Persistent lease table.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert one row per lease type if missing. Existing rows are untouched.
    async fn seed(&self, lease_types: &[&str]) -> Result<(), DbError>;

    /// The conditional update. Returns true iff the row was updated.
    async fn try_acquire_or_renew(
        &self,
        lease_type: &str,
        replica: &ReplicaId,
        duration: Duration,
    ) -> Result<bool, DbError>;

    /// Expire the lease now, only if `replica` holds it.
    async fn release(&self, lease_type: &str, replica: &ReplicaId) -> Result<(), DbError>;

    async fn get(&self, lease_type: &str) -> Result<Option<Lease>, DbError>;
}

/// Acquires, renews and releases leases on behalf of one replica.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    replica_id: ReplicaId,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, replica_id: ReplicaId, lease_duration: Duration) -> Self {
        Self {
            store,
            replica_id,
            lease_duration,
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Take the lease if available, or extend it if already held.
    pub async fn try_acquire_or_renew(&self, lease_type: &str) -> Result<bool, DbError> {
        self.store
            .try_acquire_or_renew(lease_type, &self.replica_id, self.lease_duration)
            .await
    }

    /// [`Self::try_acquire_or_renew`], with datastore errors counted as
    /// "not leader this tick". The caller's next tick is the retry.
    pub async fn is_leader(&self, lease_type: &str) -> bool {
        match self.try_acquire_or_renew(lease_type).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(lease_type, replica_id = %self.replica_id, "Lease held by another replica");
                false
            }
            Err(e) => {
                warn!(
                    lease_type,
                    replica_id = %self.replica_id,
                    error = %e,
                    "Lease acquisition failed, treating as not held"
                );
                false
            }
        }
    }

    /// Best-effort release for fast failover on shutdown.
    pub async fn release(&self, lease_type: &str) {
        if let Err(e) = self.store.release(lease_type, &self.replica_id).await {
            warn!(lease_type, error = %e, "Failed to release lease; it will expire on its own");
        }
    }
}
