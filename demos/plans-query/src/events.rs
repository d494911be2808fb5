//! Plan domain events as they arrive from the log.

use projector_core::event::{Event, EventError};
use projector_core::RecordedEvent;
use serde::{Deserialize, Serialize};

/// Type tag of [`PlanCreated`].
pub const PLAN_CREATED: &str = "PlanCreated";

/// A new investment plan was created. The plan id is the aggregate id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanCreated {
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

impl Event for PlanCreated {
    fn event_type(&self) -> &'static str {
        PLAN_CREATED
    }
}

/// Plan events this read model understands, decoded by type tag.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanEvent {
    /// See [`PlanCreated`].
    Created(PlanCreated),
}

impl PlanEvent {
    /// Decode `event` if its tag is a plan event.
    ///
    /// Returns `Ok(None)` for any other tag without touching the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if a recognized tag carries
    /// a malformed payload.
    pub fn from_recorded(event: &RecordedEvent) -> Result<Option<Self>, EventError> {
        match event.event_type.as_str() {
            PLAN_CREATED => Ok(Some(Self::Created(event.decode()?))),
            _ => Ok(None),
        }
    }
}
