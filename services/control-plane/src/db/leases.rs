//! Postgres lease table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kfm_id::{LeaseId, ReplicaId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::{error::DbError, parse_column};
use crate::workers::{Lease, LeaseStore};

impl<'r> sqlx::FromRow<'r, PgRow> for Lease {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let leader_id: Option<String> = row.try_get("leader_id")?;
        Ok(Self {
            id: parse_column(row, "id")?,
            lease_type: row.try_get("lease_type")?,
            leader_id: leader_id
                .map(|s| s.parse::<ReplicaId>())
                .transpose()
                .map_err(|e| DbError::column_decode("leader_id", e))?,
            expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        })
    }
}

/// Lease rows in `leader_leases`.
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn seed(&self, lease_types: &[&str]) -> Result<(), DbError> {
        for lease_type in lease_types {
            sqlx::query(
                r#"
                INSERT INTO leader_leases (id, lease_type, leader_id, expires_at)
                VALUES ($1, $2, NULL, to_timestamp(0))
                ON CONFLICT (lease_type) DO NOTHING
                "#,
            )
            .bind(LeaseId::new().to_string())
            .bind(*lease_type)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        }
        Ok(())
    }

    async fn try_acquire_or_renew(
        &self,
        lease_type: &str,
        replica: &ReplicaId,
        duration: Duration,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE leader_leases
            SET leader_id = $2,
                expires_at = now() + make_interval(secs => $3)
            WHERE lease_type = $1
              AND (expires_at <= now() OR leader_id = $2)
            "#,
        )
        .bind(lease_type)
        .bind(replica.to_string())
        .bind(duration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, lease_type: &str, replica: &ReplicaId) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE leader_leases
            SET expires_at = now()
            WHERE lease_type = $1 AND leader_id = $2
            "#,
        )
        .bind(lease_type)
        .bind(replica.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    async fn get(&self, lease_type: &str) -> Result<Option<Lease>, DbError> {
        sqlx::query_as::<_, Lease>(
            r#"
            SELECT id, lease_type, leader_id, expires_at
            FROM leader_leases
            WHERE lease_type = $1
            "#,
        )
        .bind(lease_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}
