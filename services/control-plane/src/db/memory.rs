//! In-memory stores.
//!
//! Same contracts as the Postgres stores, kept behind a mutex. Used by the
//! dev-mode binary when no `DATABASE_URL` is configured and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kfm_id::{ClusterId, InstanceId, LeaseId, ReplicaId};
use kfm_reconcile::Clock;

use super::DbError;
use crate::clusters::{Cluster, ClusterService, ClusterStatus, FindClusterCriteria};
use crate::instances::{Instance, InstanceStatus, InstanceStore};
use crate::workers::{Lease, LeaseStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned map is still structurally valid; every mutation is a single insert.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lease table in memory, with an injectable clock and fault switch.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, Lease>>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// While set, every call fails with [`DbError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("lease store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn seed(&self, lease_types: &[&str]) -> Result<(), DbError> {
        self.check()?;
        let epoch = chrono::DateTime::<Utc>::UNIX_EPOCH;
        let mut leases = lock(&self.leases);
        for lease_type in lease_types {
            leases.entry(lease_type.to_string()).or_insert_with(|| Lease {
                id: LeaseId::new(),
                lease_type: lease_type.to_string(),
                leader_id: None,
                expires_at: epoch,
            });
        }
        Ok(())
    }

    async fn try_acquire_or_renew(
        &self,
        lease_type: &str,
        replica: &ReplicaId,
        duration: Duration,
    ) -> Result<bool, DbError> {
        self.check()?;
        let now = self.clock.now();
        let duration = chrono::Duration::from_std(duration)
            .map_err(|e| DbError::Unavailable(format!("lease duration out of range: {e}")))?;

        let mut leases = lock(&self.leases);
        let Some(lease) = leases.get_mut(lease_type) else {
            return Ok(false);
        };

        if lease.expires_at <= now || lease.leader_id.as_ref() == Some(replica) {
            lease.leader_id = Some(*replica);
            lease.expires_at = now + duration;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, lease_type: &str, replica: &ReplicaId) -> Result<(), DbError> {
        self.check()?;
        let now = self.clock.now();
        let mut leases = lock(&self.leases);
        if let Some(lease) = leases.get_mut(lease_type) {
            if lease.leader_id.as_ref() == Some(replica) {
                lease.expires_at = now;
            }
        }
        Ok(())
    }

    async fn get(&self, lease_type: &str) -> Result<Option<Lease>, DbError> {
        self.check()?;
        Ok(lock(&self.leases).get(lease_type).cloned())
    }
}

#[derive(Debug, Clone)]
struct Stored<T> {
    row: T,
    deleted: bool,
}

/// Cluster rows in memory. Insertion order stands in for `created_at` order.
#[derive(Debug, Default)]
pub struct InMemoryClusterStore {
    rows: Mutex<Vec<Stored<Cluster>>>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, soft-deleted ones included, for assertions.
    pub fn snapshot_including_deleted(&self) -> Vec<(Cluster, bool)> {
        lock(&self.rows)
            .iter()
            .map(|s| (s.row.clone(), s.deleted))
            .collect()
    }

    fn live(&self) -> Vec<Cluster> {
        lock(&self.rows)
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.row.clone())
            .collect()
    }

    fn with_live<R>(
        &self,
        id: &ClusterId,
        f: impl FnOnce(&mut Cluster) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        let mut rows = lock(&self.rows);
        let stored = rows
            .iter_mut()
            .find(|s| !s.deleted && s.row.id == *id)
            .ok_or_else(|| DbError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        f(&mut stored.row)
    }
}

#[async_trait]
impl ClusterService for InMemoryClusterStore {
    async fn create(&self, cluster: &Cluster) -> Result<(), DbError> {
        lock(&self.rows).push(Stored {
            row: cluster.clone(),
            deleted: false,
        });
        Ok(())
    }

    async fn get(&self, id: &ClusterId) -> Result<Option<Cluster>, DbError> {
        Ok(self.live().into_iter().find(|c| c.id == *id))
    }

    async fn find_by_cluster_id(&self, cluster_id: &str) -> Result<Option<Cluster>, DbError> {
        Ok(self
            .live()
            .into_iter()
            .find(|c| c.cluster_id.as_deref() == Some(cluster_id)))
    }

    async fn update(&self, cluster: &Cluster) -> Result<(), DbError> {
        self.with_live(&cluster.id, |row| {
            let status = row.status;
            let created_at = row.created_at;
            *row = cluster.clone();
            row.status = status;
            row.created_at = created_at;
            row.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_status(&self, id: &ClusterId, status: ClusterStatus) -> Result<(), DbError> {
        self.with_live(id, |row| {
            if row.status == status {
                return Ok(());
            }
            if !row.status.can_transition_to(status) {
                return Err(DbError::InvalidTransition {
                    entity: "cluster",
                    id: id.to_string(),
                    from: row.status.to_string(),
                    to: status.to_string(),
                });
            }
            row.status = status;
            row.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn delete(&self, id: &ClusterId) -> Result<(), DbError> {
        let mut rows = lock(&self.rows);
        if let Some(stored) = rows.iter_mut().find(|s| !s.deleted && s.row.id == *id) {
            stored.deleted = true;
        }
        Ok(())
    }

    async fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<Cluster>, DbError> {
        Ok(self
            .live()
            .into_iter()
            .filter(|c| c.status == status)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Cluster>, DbError> {
        Ok(self.live())
    }

    async fn find_cluster(&self, criteria: &FindClusterCriteria) -> Result<Option<Cluster>, DbError> {
        Ok(self.live().into_iter().find(|c| criteria.matches(c)))
    }

    async fn find_all(&self, criteria: &FindClusterCriteria) -> Result<Vec<Cluster>, DbError> {
        Ok(self
            .live()
            .into_iter()
            .filter(|c| criteria.matches(c))
            .collect())
    }

    async fn count_by_status(
        &self,
        statuses: &[ClusterStatus],
    ) -> Result<HashMap<ClusterStatus, i64>, DbError> {
        let mut counts: HashMap<ClusterStatus, i64> = statuses.iter().map(|s| (*s, 0)).collect();
        for cluster in self.live() {
            if let Some(count) = counts.get_mut(&cluster.status) {
                *count += 1;
            }
        }
        Ok(counts)
    }
}

/// Instance rows in memory.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    rows: Mutex<Vec<Stored<Instance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_including_deleted(&self) -> Vec<(Instance, bool)> {
        lock(&self.rows)
            .iter()
            .map(|s| (s.row.clone(), s.deleted))
            .collect()
    }

    fn live(&self) -> Vec<Instance> {
        lock(&self.rows)
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.row.clone())
            .collect()
    }

    fn transition(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        reason: Option<&str>,
    ) -> Result<(), DbError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|s| !s.deleted && s.row.id == *id)
            .map(|s| &mut s.row)
            .ok_or_else(|| DbError::NotFound {
                entity: "instance",
                id: id.to_string(),
            })?;

        if row.status != status {
            if !row.status.can_transition_to(status) {
                return Err(DbError::InvalidTransition {
                    entity: "instance",
                    id: id.to_string(),
                    from: row.status.to_string(),
                    to: status.to_string(),
                });
            }
            row.status = status;
        }
        if let Some(reason) = reason {
            row.failed_reason = Some(reason.to_string());
        }
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &Instance) -> Result<(), DbError> {
        lock(&self.rows).push(Stored {
            row: instance.clone(),
            deleted: false,
        });
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, DbError> {
        Ok(self.live().into_iter().find(|i| i.id == *id))
    }

    async fn update(&self, instance: &Instance) -> Result<(), DbError> {
        let mut rows = lock(&self.rows);
        let row = rows
            .iter_mut()
            .find(|s| !s.deleted && s.row.id == instance.id)
            .map(|s| &mut s.row)
            .ok_or_else(|| DbError::NotFound {
                entity: "instance",
                id: instance.id.to_string(),
            })?;

        let (status, failed_reason, created_at) =
            (row.status, row.failed_reason.take(), row.created_at);
        *row = instance.clone();
        row.status = status;
        row.failed_reason = failed_reason;
        row.created_at = created_at;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), DbError> {
        self.transition(id, status, None)
    }

    async fn fail(&self, id: &InstanceId, reason: &str) -> Result<(), DbError> {
        self.transition(id, InstanceStatus::Failed, Some(reason))
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, DbError> {
        Ok(self
            .live()
            .into_iter()
            .filter(|i| i.status == status)
            .collect())
    }

    async fn delete(&self, id: &InstanceId) -> Result<(), DbError> {
        let mut rows = lock(&self.rows);
        if let Some(stored) = rows.iter_mut().find(|s| !s.deleted && s.row.id == *id) {
            stored.deleted = true;
        }
        Ok(())
    }

    async fn count_by_cluster(&self) -> Result<HashMap<ClusterId, i64>, DbError> {
        let mut counts = HashMap::new();
        for instance in self.live() {
            if let Some(cluster_id) = instance.cluster_id {
                *counts.entry(cluster_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfm_reconcile::ManualClock;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let clock = ManualClock::default();
        let store = InMemoryLeaseStore::new(Arc::new(clock.clone()));
        let me = ReplicaId::new();

        store.seed(&["cluster"]).await.unwrap();
        assert!(store
            .try_acquire_or_renew("cluster", &me, Duration::from_secs(10))
            .await
            .unwrap());

        store.seed(&["cluster", "ready_instance"]).await.unwrap();
        let lease = store.get("cluster").await.unwrap().unwrap();
        assert_eq!(lease.leader_id, Some(me), "reseeding must not reset a held lease");
        assert!(store.get("ready_instance").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cluster_status_guard() {
        let store = InMemoryClusterStore::new();
        let cluster = Cluster::accepted("aws", "us-east-1", true, 2);
        store.create(&cluster).await.unwrap();

        store
            .update_status(&cluster.id, ClusterStatus::Provisioning)
            .await
            .unwrap();
        store
            .update_status(&cluster.id, ClusterStatus::Provisioning)
            .await
            .unwrap();

        let err = store
            .update_status(&cluster.id, ClusterStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_does_not_touch_status() {
        let store = InMemoryClusterStore::new();
        let cluster = Cluster::accepted("aws", "us-east-1", true, 2);
        store.create(&cluster).await.unwrap();

        let mut stale = cluster.clone();
        stale.status = ClusterStatus::Ready;
        stale.cluster_dns = Some("apps.example.com".into());
        store.update(&stale).await.unwrap();

        let stored = store.get(&cluster.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ClusterStatus::Accepted);
        assert_eq!(stored.cluster_dns.as_deref(), Some("apps.example.com"));
    }

    #[tokio::test]
    async fn test_soft_delete_hides_row() {
        let store = InMemoryClusterStore::new();
        let cluster = Cluster::accepted("aws", "us-east-1", true, 2);
        store.create(&cluster).await.unwrap();
        store.delete(&cluster.id).await.unwrap();

        assert!(store.get(&cluster.id).await.unwrap().is_none());
        assert!(store.list_all().await.unwrap().is_empty());
        assert_eq!(store.snapshot_including_deleted().len(), 1);

        let err = store
            .update_status(&cluster.id, ClusterStatus::Provisioning)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_count_by_cluster_ignores_unplaced() {
        let store = InMemoryInstanceStore::new();
        let cluster_id = ClusterId::new();

        let mut placed = Instance::accepted("a", "alice", "org", "aws", "us-east-1", "standard");
        placed.cluster_id = Some(cluster_id);
        let unplaced = Instance::accepted("b", "bob", "org", "aws", "us-east-1", "standard");
        store.create(&placed).await.unwrap();
        store.create(&unplaced).await.unwrap();

        let counts = store.count_by_cluster().await.unwrap();
        assert_eq!(counts.get(&cluster_id), Some(&1));
        assert_eq!(counts.len(), 1);
    }
    #[tokio::test]
    async fn test_find_cluster_matches_criteria() {
        let store = InMemoryClusterStore::new();
        let mut developer_only =
            Cluster::accepted("aws", "us-east-1", true, 2).with_status(ClusterStatus::Ready);
        developer_only.supported_instance_type = "developer".into();
        let standard = Cluster::accepted("aws", "us-east-1", true, 2).with_status(ClusterStatus::Ready);
        store.create(&developer_only).await.unwrap();
        store.create(&standard).await.unwrap();

        let criteria = FindClusterCriteria {
            supported_instance_type: Some("standard".into()),
            ..FindClusterCriteria::placement("aws", "us-east-1", ClusterStatus::Ready)
        };
        let found = store.find_cluster(&criteria).await.unwrap().unwrap();
        assert_eq!(found.id, standard.id);

        let counts = store
            .count_by_status(&[ClusterStatus::Ready, ClusterStatus::Full])
            .await
            .unwrap();
        assert_eq!(counts[&ClusterStatus::Ready], 2);
        assert_eq!(counts[&ClusterStatus::Full], 0);
    }

    #[tokio::test]
    async fn test_unavailable_lease_store_errors() {
        let store = InMemoryLeaseStore::new(Arc::new(ManualClock::default()));
        store.seed(&["cluster"]).await.unwrap();
        store.set_unavailable(true);

        let err = store
            .try_acquire_or_renew("cluster", &ReplicaId::new(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Unavailable(_)));

        store.set_unavailable(false);
        assert!(store.get("cluster").await.unwrap().is_some());
    }
}
