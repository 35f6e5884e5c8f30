//! Database error types.

use thiserror::Error;

/// Datastore operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/control-plane.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Row does not exist (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Status change rejected by the lifecycle state machine.
    #[error("{entity} {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Row exists but a column could not be decoded into a domain value.
    #[error("corrupt {entity} row: {message}")]
    Decode {
        entity: &'static str,
        message: String,
    },

    /// The datastore is unreachable (in-memory fault injection).
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Wrap a column decode failure as an sqlx error so it can surface from `FromRow`.
    pub(crate) fn column_decode(column: &str, message: impl std::fmt::Display) -> sqlx::Error {
        sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: message.to_string().into(),
        }
    }
}
