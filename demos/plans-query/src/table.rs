//! Storage for the `plans_query` read model.
//!
//! Reads and setup go through [`PlanTable`]; writes that must commit together
//! with the checkpoint go through [`PlanTableWriter`], which is generic over the
//! checkpoint store's transaction type.

use crate::plan::Plan;
use projector_core::Result;
use projector_postgres::projection_error;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;

/// Setup and read access to the plans table.
pub trait PlanTable: Send + Sync + 'static {
    /// Create the table if it does not exist. Must be idempotent.
    fn create(&self) -> impl Future<Output = Result<()>> + Send;

    /// Every plan, ordered by id.
    fn all(&self) -> impl Future<Output = Result<Vec<Plan>>> + Send;

    /// A single plan.
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Plan>>> + Send;
}

/// Transactional writes to the plans table.
pub trait PlanTableWriter<Tx>: PlanTable {
    /// Insert `plan`, replacing any row with the same id.
    fn insert(&self, tx: &mut Tx, plan: &Plan) -> impl Future<Output = Result<()>> + Send;

    /// Remove every row.
    fn truncate(&self, tx: &mut Tx) -> impl Future<Output = Result<()>> + Send;
}

/// The plans table in `PostgreSQL`.
///
/// ```sql
/// CREATE TABLE plans_query (
///     id              TEXT PRIMARY KEY,
///     assets          TEXT[] NOT NULL,
///     security        TEXT NOT NULL,
///     strategy        TEXT NOT NULL,
///     quantum         INTEGER NOT NULL,
///     loss_protection DOUBLE PRECISION NOT NULL,
///     time_frame      INTEGER NOT NULL
/// );
/// ```
#[derive(Clone, Debug)]
pub struct PgPlanTable {
    pool: PgPool,
}

impl PgPlanTable {
    /// Create a table handle on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PlanTable for PgPlanTable {
    async fn create(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plans_query (
                id              TEXT PRIMARY KEY,
                assets          TEXT[] NOT NULL,
                security        TEXT NOT NULL,
                strategy        TEXT NOT NULL,
                quantum         INTEGER NOT NULL,
                loss_protection DOUBLE PRECISION NOT NULL,
                time_frame      INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to create plans_query", &e))?;

        Ok(())
    }

    async fn all(&self) -> Result<Vec<Plan>> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, assets, security, strategy, quantum, loss_protection, time_frame
             FROM plans_query
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to load plans", &e))
    }

    async fn get(&self, id: &str) -> Result<Option<Plan>> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, assets, security, strategy, quantum, loss_protection, time_frame
             FROM plans_query
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| projection_error("Failed to load plan", &e))
    }
}

impl PlanTableWriter<Transaction<'static, Postgres>> for PgPlanTable {
    async fn insert(&self, tx: &mut Transaction<'static, Postgres>, plan: &Plan) -> Result<()> {
        sqlx::query(
            "INSERT INTO plans_query (id, assets, security, strategy, quantum, loss_protection, time_frame)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                 assets = EXCLUDED.assets,
                 security = EXCLUDED.security,
                 strategy = EXCLUDED.strategy,
                 quantum = EXCLUDED.quantum,
                 loss_protection = EXCLUDED.loss_protection,
                 time_frame = EXCLUDED.time_frame",
        )
        .bind(&plan.id)
        .bind(&plan.assets)
        .bind(&plan.security)
        .bind(&plan.strategy)
        .bind(plan.quantum)
        .bind(plan.loss_protection)
        .bind(plan.time_frame)
        .execute(&mut **tx)
        .await
        .map_err(|e| projection_error("Failed to insert plan", &e))?;

        Ok(())
    }

    async fn truncate(&self, tx: &mut Transaction<'static, Postgres>) -> Result<()> {
        sqlx::query("TRUNCATE plans_query")
            .execute(&mut **tx)
            .await
            .map_err(|e| projection_error("Failed to truncate plans_query", &e))?;

        Ok(())
    }
}
