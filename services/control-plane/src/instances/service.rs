//! Instance persistence surface.

use std::collections::HashMap;

use async_trait::async_trait;
use kfm_id::{ClusterId, InstanceId};

use super::model::{Instance, InstanceStatus};
use crate::db::DbError;

/// Instance persistence. Soft-deleted rows are invisible to every method.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create(&self, instance: &Instance) -> Result<(), DbError>;

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, DbError>;

    /// Persist every mutable column except `status` and `failed_reason`.
    async fn update(&self, instance: &Instance) -> Result<(), DbError>;

    /// Lifecycle-guarded status change. Same status is a no-op.
    async fn update_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), DbError>;

    /// Move to `failed`, recording why.
    async fn fail(&self, id: &InstanceId, reason: &str) -> Result<(), DbError>;

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, DbError>;

    /// Soft delete.
    async fn delete(&self, id: &InstanceId) -> Result<(), DbError>;

    /// Number of live instances hosted on each cluster. Clusters hosting
    /// nothing are absent from the map.
    async fn count_by_cluster(&self) -> Result<HashMap<ClusterId, i64>, DbError>;
}
