//! The `plans_query` projection.

use crate::events::PlanEvent;
use crate::plan::Plan;
use crate::table::{PlanTable, PlanTableWriter};
use projector_core::{BoxFuture, CheckpointStore, Projection, ProjectionError, RecordedEvent, Result};

/// Registered name of the projection and its checkpoint row.
pub const NAME: &str = "plans_query";

/// Maintains one row per created plan.
///
/// `PlanCreated` inserts a row keyed by the event's aggregate id. Every other
/// event type is accepted and ignored, so the checkpoint still advances past it.
/// A `PlanCreated` whose payload does not decode halts the projection at that
/// event.
///
/// # Example
///
/// ```ignore
/// let plans = Arc::new(PlansQuery::new(PgPlanTable::new(pool.clone())));
/// runner.register(plans.clone())?;
/// let handle = runner.start().await;
///
/// handle.wait_until_caught_up(NAME, head).await?;
/// let all = plans.all().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PlansQuery<T> {
    table: T,
}

impl<T: PlanTable> PlansQuery<T> {
    /// Create the projection over `table`.
    #[must_use]
    pub const fn new(table: T) -> Self {
        Self { table }
    }

    /// Every plan, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the table cannot be read.
    pub async fn all(&self) -> Result<Vec<Plan>> {
        self.table.all().await
    }

    /// A single plan by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the table cannot be read.
    pub async fn get(&self, id: &str) -> Result<Option<Plan>> {
        self.table.get(id).await
    }

    /// The underlying table.
    #[must_use]
    pub const fn table(&self) -> &T {
        &self.table
    }
}

impl<S, T> Projection<S> for PlansQuery<T>
where
    S: CheckpointStore,
    T: PlanTableWriter<S::Transaction>,
{
    fn name(&self) -> &str {
        NAME
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.table
                .create()
                .await
                .map_err(|e| ProjectionError::Initialization {
                    projection: NAME.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn reset<'a>(&'a self, tx: &'a mut S::Transaction) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.table.truncate(tx).await })
    }

    fn apply<'a>(
        &'a self,
        tx: &'a mut S::Transaction,
        event: &'a RecordedEvent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match PlanEvent::from_recorded(event) {
                Ok(Some(PlanEvent::Created(created))) => {
                    let plan = Plan::from_created(event.aggregate_id.clone(), created);
                    tracing::debug!(
                        projection = NAME,
                        plan_id = %plan.id,
                        sequence = event.global_sequence,
                        "Recording plan"
                    );
                    self.table.insert(tx, &plan).await
                }
                Ok(None) => Ok(()),
                Err(e) => Err(ProjectionError::apply(NAME, event, e)),
            }
        })
    }
}
