//! Fluent test harness for a single projection.

use crate::{InMemoryCheckpointStore, InMemoryEventLog};
use futures::StreamExt;
use projector_core::event::Event;
use projector_core::{CheckpointStore, EventSource, Projection, ProjectionError, RecordedEvent, Result};
use serde::Serialize;
use std::sync::Arc;

/// Test harness for projections providing a fluent testing API.
///
/// Events given to the harness are appended to its [`InMemoryEventLog`] and
/// applied exactly the way the runner does it: one transaction per event,
/// checkpoint advanced from `c` to the event's sequence, then `apply`, then
/// commit. Tests can therefore assert on table state and checkpoint together
/// without spinning up a runner.
///
/// # Example
///
/// ```ignore
/// let mut harness = ProjectionTestHarness::new(PlansQuery::new(table)).await?;
///
/// harness
///     .given_event("plan-1", &PlanEvent::Created(plan))
///     .await?
///     .then_checkpoint_is(1)
///     .await;
///
/// assert_eq!(harness.projection().get("p1").await?.unwrap().quantum, 3);
/// ```
#[derive(Debug)]
pub struct ProjectionTestHarness<P> {
    projection: P,
    log: Arc<InMemoryEventLog>,
    store: Arc<InMemoryCheckpointStore>,
}

impl<P: Projection<InMemoryCheckpointStore>> ProjectionTestHarness<P> {
    /// Create a harness with an empty log, initializing the projection and
    /// registering its checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if initialization fails.
    pub async fn new(projection: P) -> Result<Self> {
        Self::with_log(projection, Arc::new(InMemoryEventLog::new())).await
    }

    /// Create a harness over an existing log. Nothing is applied yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if initialization fails.
    pub async fn with_log(projection: P, log: Arc<InMemoryEventLog>) -> Result<Self> {
        let store = Arc::new(InMemoryCheckpointStore::new());
        projection.initialize().await?;
        store.register(projection.name()).await?;
        Ok(Self {
            projection,
            log,
            store,
        })
    }

    /// Append a domain event and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if encoding or applying fails.
    pub async fn given_event<E: Event + Serialize>(
        &mut self,
        aggregate_id: &str,
        event: &E,
    ) -> Result<&mut Self> {
        let sequence = self.log.append_event(aggregate_id, event)?;
        self.apply_through(sequence).await?;
        Ok(self)
    }

    /// Append a series of domain events and apply them in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if any event fails to encode or apply.
    pub async fn given_events<E: Event + Serialize>(
        &mut self,
        aggregate_id: &str,
        events: &[E],
    ) -> Result<&mut Self> {
        for event in events {
            self.given_event(aggregate_id, event).await?;
        }
        Ok(self)
    }

    /// Append a raw payload with an arbitrary type tag and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if applying fails.
    pub async fn given_raw(
        &mut self,
        aggregate_id: &str,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<&mut Self> {
        let sequence = self.log.append(aggregate_id, event_type, payload);
        self.apply_through(sequence).await?;
        Ok(self)
    }

    /// Apply every event in the log after the checkpoint.
    ///
    /// Like the runner, this never steps over a gap: events are applied up to
    /// the first missing sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] on the first failing event, or
    /// [`ProjectionError::Other`] at a gap in the log.
    pub async fn replay(&mut self) -> Result<u64> {
        let head = self.log.head().await?;
        self.apply_through(head).await?;
        self.checkpoint().await
    }

    async fn apply_through(&self, target: u64) -> Result<()> {
        let name = self.projection.name().to_string();
        let from = self.store.get(&name).await?;
        let events: Vec<RecordedEvent> = self
            .log
            .replay_from(from + 1)
            .take_while(|e| {
                let keep = !matches!(e, Ok(e) if e.global_sequence > target);
                async move { keep }
            })
            .map(|e| e.map_err(ProjectionError::from))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;

        let mut checkpoint = from;
        for event in &events {
            let expected = checkpoint + 1;
            if event.global_sequence != expected {
                return Err(ProjectionError::Other(format!(
                    "'{name}' needs sequence {expected} next but the log has {}",
                    event.global_sequence
                )));
            }

            let mut tx = self.store.begin().await?;
            self.store
                .advance(&mut tx, &name, checkpoint, event.global_sequence)
                .await?;
            self.projection.apply(&mut tx, event).await?;
            self.store.commit(tx).await?;
            checkpoint = event.global_sequence;
        }
        Ok(())
    }

    /// Committed checkpoint of the projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the store cannot be read.
    pub async fn checkpoint(&self) -> Result<u64> {
        self.store.get(self.projection.name()).await
    }

    /// Assert the committed checkpoint.
    ///
    /// # Panics
    ///
    /// Panics if the checkpoint differs (this is a test assertion).
    pub async fn then_checkpoint_is(&self, expected: u64) -> &Self {
        let actual = self.checkpoint().await.unwrap();
        assert_eq!(
            actual, expected,
            "Expected checkpoint of '{}' to be {expected}, found {actual}",
            self.projection.name()
        );
        self
    }

    /// Get a reference to the projection.
    ///
    /// Useful for calling projection-specific query methods.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }

    /// The event log backing this harness.
    #[must_use]
    pub const fn log(&self) -> &Arc<InMemoryEventLog> {
        &self.log
    }

    /// The checkpoint store backing this harness.
    #[must_use]
    pub const fn store(&self) -> &Arc<InMemoryCheckpointStore> {
        &self.store
    }
}
