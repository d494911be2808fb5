//! The plan row served to query callers.

use crate::events::PlanCreated;
use serde::{Deserialize, Serialize};

/// One row of the `plans_query` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    /// Plan id (the aggregate id).
    pub id: String,
    /// Assets the plan invests in.
    pub assets: Vec<String>,
    /// Multi-sig wallet security scheme.
    pub security: String,
    /// Profit sharing strategy.
    pub strategy: String,
    /// Investment quantum.
    pub quantum: i32,
    /// Fraction of capital protected against loss.
    pub loss_protection: f64,
    /// Investment horizon in days.
    pub time_frame: i32,
}

impl Plan {
    /// Build the row for a freshly created plan.
    #[must_use]
    pub fn from_created(id: impl Into<String>, event: PlanCreated) -> Self {
        Self {
            id: id.into(),
            assets: event.assets,
            security: event.security,
            strategy: event.strategy,
            quantum: event.quantum,
            loss_protection: event.loss_protection,
            time_frame: event.time_frame,
        }
    }
}
