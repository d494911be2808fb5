//! PostgreSQL-backed checkpoint store.

use crate::error::projection_error;
use crate::{from_db, to_db};
use chrono::{DateTime, Utc};
use projector_core::{Checkpoint, CheckpointStore, ProjectionError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

/// Checkpoint store over the `projection_checkpoints` table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE projection_checkpoints (
///     projection_name       TEXT PRIMARY KEY,
///     last_applied_sequence BIGINT NOT NULL DEFAULT 0,
///     updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
///
/// # Conditional Advance
///
/// `advance` is a single `UPDATE ... WHERE last_applied_sequence = $from`. The
/// row lock it takes is held until the transaction ends, so a second runner
/// advancing the same projection blocks, then re-evaluates the predicate
/// against the committed value, matches nothing and gets
/// [`ProjectionError::Conflict`] before its projection writes anything.
///
/// # Example
///
/// ```ignore
/// let store = PostgresCheckpointStore::new(pool);
/// store.migrate().await?;
///
/// let mut tx = store.begin().await?;
/// store.advance(&mut tx, "plans_query", 0, 1).await?;
/// sqlx::query("INSERT INTO plans_query ...").execute(&mut *tx).await?;
/// store.commit(tx).await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Create a new checkpoint store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new checkpoint store with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] or [`ProjectionError::Storage`]
    /// if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| projection_error("Failed to connect", &e))?;

        Ok(Self::new(pool))
    }

    /// Create `projection_checkpoints` and, if absent, the `events` table with
    /// its commit-notification trigger.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    ///
    /// Projections writing their own tables use it for setup and reads.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current(
        tx: &mut Transaction<'static, Postgres>,
        projection_name: &str,
    ) -> Result<Option<u64>> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT last_applied_sequence FROM projection_checkpoints WHERE projection_name = $1",
        )
        .bind(projection_name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| projection_error("Failed to read checkpoint", &e))?;

        Ok(current.map(from_db))
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction> {
        self.pool
            .begin()
            .await
            .map_err(|e| projection_error("Failed to begin transaction", &e))
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| projection_error("Failed to commit transaction", &e))
    }

    async fn register(&self, projection_name: &str) -> Result<u64> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (projection_name, last_applied_sequence, updated_at)
             VALUES ($1, 0, now())
             ON CONFLICT (projection_name) DO NOTHING",
        )
        .bind(projection_name)
        .execute(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to register checkpoint", &e))?;

        self.get(projection_name).await
    }

    async fn get(&self, projection_name: &str) -> Result<u64> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT last_applied_sequence FROM projection_checkpoints WHERE projection_name = $1",
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to load checkpoint", &e))?;

        Ok(current.map_or(0, from_db))
    }

    async fn advance(
        &self,
        tx: &mut Self::Transaction,
        projection_name: &str,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE projection_checkpoints
             SET last_applied_sequence = $3, updated_at = now()
             WHERE projection_name = $1 AND last_applied_sequence = $2",
        )
        .bind(projection_name)
        .bind(to_db(from))
        .bind(to_db(to))
        .execute(&mut **tx)
        .await
        .map_err(|e| projection_error("Failed to advance checkpoint", &e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match Self::current(tx, projection_name).await? {
            Some(actual) => Err(ProjectionError::Conflict {
                projection: projection_name.to_string(),
                expected: from,
                actual,
            }),
            None => Err(ProjectionError::UnknownProjection(
                projection_name.to_string(),
            )),
        }
    }

    async fn reset(&self, tx: &mut Self::Transaction, projection_name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (projection_name, last_applied_sequence, updated_at)
             VALUES ($1, 0, now())
             ON CONFLICT (projection_name) DO UPDATE
             SET last_applied_sequence = 0, updated_at = now()",
        )
        .bind(projection_name)
        .execute(&mut **tx)
        .await
        .map_err(|e| projection_error("Failed to reset checkpoint", &e))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT projection_name, last_applied_sequence, updated_at
             FROM projection_checkpoints
             ORDER BY projection_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to list checkpoints", &e))?;

        Ok(rows
            .into_iter()
            .map(|(projection_name, sequence, updated_at)| Checkpoint {
                projection_name,
                last_applied_sequence: from_db(sequence),
                updated_at,
            })
            .collect())
    }
}
