//! Read/write surface over cluster rows.
//!
//! The cluster reconciler is the main consumer; the API layer uses the same
//! surface to answer queries and to record agent-reported readiness.

use std::collections::HashMap;

use async_trait::async_trait;
use kfm_id::ClusterId;

use super::model::{Cluster, ClusterStatus, FindClusterCriteria};
use crate::db::DbError;

/// Cluster persistence. Soft-deleted rows are invisible to every method.
#[async_trait]
pub trait ClusterService: Send + Sync {
    async fn create(&self, cluster: &Cluster) -> Result<(), DbError>;

    async fn get(&self, id: &ClusterId) -> Result<Option<Cluster>, DbError>;

    /// Look up by provider-assigned cluster id.
    async fn find_by_cluster_id(&self, cluster_id: &str) -> Result<Option<Cluster>, DbError>;

    /// Persist every mutable column except `status`.
    async fn update(&self, cluster: &Cluster) -> Result<(), DbError>;

    /// Move a cluster to `status` if the lifecycle allows it from its current
    /// status. Setting the current status again is a no-op.
    async fn update_status(&self, id: &ClusterId, status: ClusterStatus) -> Result<(), DbError>;

    /// Soft delete.
    async fn delete(&self, id: &ClusterId) -> Result<(), DbError>;

    async fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<Cluster>, DbError>;

    async fn list_all(&self) -> Result<Vec<Cluster>, DbError>;

    /// Oldest cluster matching `criteria`.
    async fn find_cluster(&self, criteria: &FindClusterCriteria) -> Result<Option<Cluster>, DbError>;

    /// Every cluster matching `criteria`, oldest first.
    async fn find_all(&self, criteria: &FindClusterCriteria) -> Result<Vec<Cluster>, DbError>;

    /// Row counts for each requested status. Statuses with no rows map to 0.
    async fn count_by_status(
        &self,
        statuses: &[ClusterStatus],
    ) -> Result<HashMap<ClusterStatus, i64>, DbError>;
}
