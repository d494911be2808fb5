//! Event source adapter: the read side of the event store.
//!
//! The engine never writes events. It only needs three things from the store:
//!
//! - `next_after(sequence)`: the first committed event with a higher sequence
//! - `replay_from(sequence)`: a lazy, ordered, finite stream starting at `sequence`
//! - `subscribe()`: a push notification whenever the head of the log moves
//!
//! plus `head()` so operators can compute lag.
//!
//! # Ordering Contract
//!
//! Implementations must return events in strictly increasing `global_sequence`
//! order. The runner still checks every event against its checkpoint and refuses
//! to apply anything other than `checkpoint + 1`.
//!
//! # Implementations
//!
//! - `PostgresEventSource` (in `projector-postgres`): `events` table + `LISTEN/NOTIFY`
//! - `InMemoryEventLog` (in `projector-testing`): deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures and streams so the runner can hold an
//! `Arc<dyn EventSource>` shared by every projection.

use crate::BoxFuture;
use crate::event::RecordedEvent;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised by an event source.
///
/// All of them are treated as transient by the runner: the event is not
/// consumed and the read is retried.
#[derive(Error, Debug, Clone)]
pub enum EventSourceError {
    /// Database connection or query failed.
    #[error("Event source database error: {0}")]
    Database(String),

    /// Could not register for commit notifications.
    #[error("Event source subscription failed: {0}")]
    Subscription(String),

    /// A stored row could not be turned into a [`RecordedEvent`].
    #[error("Malformed event row: {0}")]
    Malformed(String),
}

/// Receiver for commit notifications.
///
/// The value is the highest committed `global_sequence` the source has seen.
/// Receivers only care that it changed; the runner re-reads the log afterwards.
pub type EventNotifications = watch::Receiver<u64>;

/// Read-only access to the ordered global event log.
///
/// Shared by every projection's dispatch loop, so implementations must be safe
/// for concurrent readers.
pub trait EventSource: Send + Sync {
    /// Highest committed `global_sequence`, or 0 for an empty log.
    ///
    /// # Errors
    ///
    /// Returns [`EventSourceError`] if the store cannot be reached.
    fn head(&self) -> BoxFuture<'_, Result<u64, EventSourceError>>;

    /// The committed event with the smallest `global_sequence` greater than
    /// `sequence`, or `None` if there is none yet.
    ///
    /// # Errors
    ///
    /// Returns [`EventSourceError`] if the store cannot be reached.
    fn next_after(&self, sequence: u64)
    -> BoxFuture<'_, Result<Option<RecordedEvent>, EventSourceError>>;

    /// Lazily stream every committed event with `global_sequence >= sequence`,
    /// in order.
    ///
    /// The stream is finite: it ends at the head as observed while reading.
    /// Dropping it and calling `replay_from` again with a later sequence resumes
    /// without gaps or duplicates.
    fn replay_from(
        &self,
        sequence: u64,
    ) -> BoxStream<'_, Result<RecordedEvent, EventSourceError>>;

    /// Register for commit notifications.
    ///
    /// # Errors
    ///
    /// Returns [`EventSourceError::Subscription`] if notifications are not
    /// available. Callers fall back to polling.
    fn subscribe(&self) -> BoxFuture<'_, Result<EventNotifications, EventSourceError>>;
}
