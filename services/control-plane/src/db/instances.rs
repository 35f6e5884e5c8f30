//! Postgres instance rows.

use std::collections::HashMap;

use async_trait::async_trait;
use kfm_id::{ClusterId, InstanceId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::{error::DbError, parse_column};
use crate::instances::{Instance, InstanceStatus, InstanceStore};

impl<'r> sqlx::FromRow<'r, PgRow> for Instance {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let cluster_id: Option<String> = row.try_get("cluster_id")?;
        Ok(Self {
            id: parse_column(row, "id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            organisation_id: row.try_get("organisation_id")?,
            cloud_provider: row.try_get("cloud_provider")?,
            region: row.try_get("region")?,
            multi_az: row.try_get("multi_az")?,
            instance_type: row.try_get("instance_type")?,
            status: parse_column(row, "status")?,
            cluster_id: cluster_id
                .map(|s| s.parse::<ClusterId>())
                .transpose()
                .map_err(|e| DbError::column_decode("cluster_id", e))?,
            bootstrap_server_host: row.try_get("bootstrap_server_host")?,
            desired_engine_version: row.try_get("desired_engine_version")?,
            actual_engine_version: row.try_get("actual_engine_version")?,
            desired_operator_version: row.try_get("desired_operator_version")?,
            actual_operator_version: row.try_get("actual_operator_version")?,
            failed_reason: row.try_get("failed_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Instance rows in `instances`.
#[derive(Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn transition(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        reason: Option<&str>,
    ) -> Result<(), DbError> {
        let allowed_from: Vec<String> = InstanceStatus::ALL
            .iter()
            .filter(|from| **from == status || from.can_transition_to(status))
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = $2,
                failed_reason = COALESCE($4, failed_reason),
                updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL AND status = ANY($3)
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(&allowed_from)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(id).await? {
            Some(current) => Err(DbError::InvalidTransition {
                entity: "instance",
                id: id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            }),
            None => Err(DbError::NotFound {
                entity: "instance",
                id: id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn create(&self, instance: &Instance) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, owner, organisation_id, cloud_provider, region, multi_az,
                instance_type, status, cluster_id, bootstrap_server_host,
                desired_engine_version, actual_engine_version,
                desired_operator_version, actual_operator_version,
                failed_reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(&instance.owner)
        .bind(&instance.organisation_id)
        .bind(&instance.cloud_provider)
        .bind(&instance.region)
        .bind(instance.multi_az)
        .bind(&instance.instance_type)
        .bind(instance.status.as_str())
        .bind(instance.cluster_id.map(|id| id.to_string()))
        .bind(&instance.bootstrap_server_host)
        .bind(&instance.desired_engine_version)
        .bind(&instance.actual_engine_version)
        .bind(&instance.desired_operator_version)
        .bind(&instance.actual_operator_version)
        .bind(&instance.failed_reason)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, DbError> {
        sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn update(&self, instance: &Instance) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET name = $2,
                instance_type = $3,
                cluster_id = $4,
                bootstrap_server_host = $5,
                desired_engine_version = $6,
                actual_engine_version = $7,
                desired_operator_version = $8,
                actual_operator_version = $9,
                updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(&instance.instance_type)
        .bind(instance.cluster_id.map(|id| id.to_string()))
        .bind(&instance.bootstrap_server_host)
        .bind(&instance.desired_engine_version)
        .bind(&instance.actual_engine_version)
        .bind(&instance.desired_operator_version)
        .bind(&instance.actual_operator_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound {
                entity: "instance",
                id: instance.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), DbError> {
        self.transition(id, status, None).await
    }

    async fn fail(&self, id: &InstanceId, reason: &str) -> Result<(), DbError> {
        self.transition(id, InstanceStatus::Failed, Some(reason)).await
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, DbError> {
        sqlx::query_as::<_, Instance>(
            r#"
            SELECT * FROM instances
            WHERE status = $1 AND deleted_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn delete(&self, id: &InstanceId) -> Result<(), DbError> {
        sqlx::query("UPDATE instances SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn count_by_cluster(&self) -> Result<HashMap<ClusterId, i64>, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT cluster_id, COUNT(*)::BIGINT
            FROM instances
            WHERE deleted_at IS NULL AND cluster_id IS NOT NULL
            GROUP BY cluster_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter()
            .map(|(cluster_id, count)| {
                cluster_id
                    .parse::<ClusterId>()
                    .map(|id| (id, count))
                    .map_err(|e| DbError::Decode {
                        entity: "instance",
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}
