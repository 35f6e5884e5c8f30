//! Postgres cluster rows.

use std::collections::HashMap;

use async_trait::async_trait;
use kfm_id::ClusterId;
use sqlx::{postgres::PgPool, postgres::PgRow, Postgres, QueryBuilder, Row};

use super::{error::DbError, parse_column};
use crate::clusters::{Cluster, ClusterService, ClusterStatus, FindClusterCriteria};

const CLUSTER_COLUMNS: &str = "id, cluster_id, external_id, cloud_provider, region, multi_az, \
     status, identity_provider_id, cluster_dns, supported_instance_type, instance_limit, \
     schedulable, resources_hash, created_at, updated_at";

impl<'r> sqlx::FromRow<'r, PgRow> for Cluster {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: parse_column(row, "id")?,
            cluster_id: row.try_get("cluster_id")?,
            external_id: row.try_get("external_id")?,
            cloud_provider: row.try_get("cloud_provider")?,
            region: row.try_get("region")?,
            multi_az: row.try_get("multi_az")?,
            status: parse_column(row, "status")?,
            identity_provider_id: row.try_get("identity_provider_id")?,
            cluster_dns: row.try_get("cluster_dns")?,
            supported_instance_type: row.try_get("supported_instance_type")?,
            instance_limit: row.try_get("instance_limit")?,
            schedulable: row.try_get("schedulable")?,
            resources_hash: row.try_get("resources_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Cluster rows in `clusters`. Soft-deleted rows carry a `deleted_at`.
#[derive(Clone)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select<'a>() -> QueryBuilder<'a, Postgres> {
        QueryBuilder::new(format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE deleted_at IS NULL"
        ))
    }

    fn filtered<'a>(criteria: &'a FindClusterCriteria) -> QueryBuilder<'a, Postgres> {
        let mut query = Self::select();
        if let Some(provider) = &criteria.cloud_provider {
            query.push(" AND cloud_provider = ").push_bind(provider.as_str());
        }
        if let Some(region) = &criteria.region {
            query.push(" AND region = ").push_bind(region.as_str());
        }
        if let Some(multi_az) = criteria.multi_az {
            query.push(" AND multi_az = ").push_bind(multi_az);
        }
        if let Some(status) = criteria.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(schedulable) = criteria.schedulable {
            query.push(" AND schedulable = ").push_bind(schedulable);
        }
        if let Some(instance_type) = &criteria.supported_instance_type {
            query
                .push(" AND ")
                .push_bind(instance_type.as_str())
                .push(" = ANY(string_to_array(replace(supported_instance_type, ' ', ''), ','))");
        }
        query.push(" ORDER BY created_at, id");
        query
    }
}

#[async_trait]
impl ClusterService for PgClusterStore {
    async fn create(&self, cluster: &Cluster) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO clusters (
                id, cluster_id, external_id, cloud_provider, region, multi_az, status,
                identity_provider_id, cluster_dns, supported_instance_type, instance_limit,
                schedulable, resources_hash, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(cluster.id.to_string())
        .bind(&cluster.cluster_id)
        .bind(&cluster.external_id)
        .bind(&cluster.cloud_provider)
        .bind(&cluster.region)
        .bind(cluster.multi_az)
        .bind(cluster.status.as_str())
        .bind(&cluster.identity_provider_id)
        .bind(&cluster.cluster_dns)
        .bind(&cluster.supported_instance_type)
        .bind(cluster.instance_limit)
        .bind(cluster.schedulable)
        .bind(&cluster.resources_hash)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    async fn get(&self, id: &ClusterId) -> Result<Option<Cluster>, DbError> {
        let mut query = Self::select();
        query.push(" AND id = ").push_bind(id.to_string());
        query
            .build_query_as::<Cluster>()
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn find_by_cluster_id(&self, cluster_id: &str) -> Result<Option<Cluster>, DbError> {
        let mut query = Self::select();
        query.push(" AND cluster_id = ").push_bind(cluster_id);
        query
            .build_query_as::<Cluster>()
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn update(&self, cluster: &Cluster) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET cluster_id = $2,
                external_id = $3,
                cloud_provider = $4,
                region = $5,
                multi_az = $6,
                identity_provider_id = $7,
                cluster_dns = $8,
                supported_instance_type = $9,
                instance_limit = $10,
                schedulable = $11,
                resources_hash = $12,
                updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(cluster.id.to_string())
        .bind(&cluster.cluster_id)
        .bind(&cluster.external_id)
        .bind(&cluster.cloud_provider)
        .bind(&cluster.region)
        .bind(cluster.multi_az)
        .bind(&cluster.identity_provider_id)
        .bind(&cluster.cluster_dns)
        .bind(&cluster.supported_instance_type)
        .bind(cluster.instance_limit)
        .bind(cluster.schedulable)
        .bind(&cluster.resources_hash)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound {
                entity: "cluster",
                id: cluster.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_status(&self, id: &ClusterId, status: ClusterStatus) -> Result<(), DbError> {
        let allowed_from: Vec<String> = ClusterStatus::predecessors(status)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET status = $2, updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL AND status = ANY($3)
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(&allowed_from)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing moved: already there, gone, or an illegal edge.
        match self.get(id).await? {
            Some(current) if current.status == status => Ok(()),
            Some(current) => Err(DbError::InvalidTransition {
                entity: "cluster",
                id: id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            }),
            None => Err(DbError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            }),
        }
    }

    async fn delete(&self, id: &ClusterId) -> Result<(), DbError> {
        sqlx::query("UPDATE clusters SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<Cluster>, DbError> {
        self.find_all(&FindClusterCriteria {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Cluster>, DbError> {
        self.find_all(&FindClusterCriteria::default()).await
    }

    async fn find_cluster(&self, criteria: &FindClusterCriteria) -> Result<Option<Cluster>, DbError> {
        let mut query = Self::filtered(criteria);
        query.push(" LIMIT 1");
        query
            .build_query_as::<Cluster>()
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn find_all(&self, criteria: &FindClusterCriteria) -> Result<Vec<Cluster>, DbError> {
        Self::filtered(criteria)
            .build_query_as::<Cluster>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn count_by_status(
        &self,
        statuses: &[ClusterStatus],
    ) -> Result<HashMap<ClusterStatus, i64>, DbError> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::BIGINT
            FROM clusters
            WHERE deleted_at IS NULL AND status = ANY($1)
            GROUP BY status
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut counts: HashMap<ClusterStatus, i64> = statuses.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            let status = status.parse::<ClusterStatus>().map_err(|e| DbError::Decode {
                entity: "cluster",
                message: e.to_string(),
            })?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}
