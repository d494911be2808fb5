//! Event trait and the recorded event envelope.
//!
//! Domain events are produced by the aggregate layer and committed to the event
//! store. By the time a projection sees one it is a [`RecordedEvent`]: an
//! immutable envelope carrying the aggregate id, the global sequence assigned at
//! commit, an explicit type tag and the encoded payload.
//!
//! # Type Tags
//!
//! Projections never inspect payloads to discover what they are. They switch on
//! [`RecordedEvent::event_type`] and only decode the payloads they recognize, so an
//! unknown tag is simply ignored.
//!
//! # Example
//!
//! ```
//! use projector_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum WalletEvent {
//!     WalletOpened { owner: String },
//!     WalletClosed,
//! }
//!
//! impl Event for WalletEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             WalletEvent::WalletOpened { .. } => "WalletOpened",
//!             WalletEvent::WalletClosed => "WalletClosed",
//!         }
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The payload tag does not match the type being decoded.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A domain event that can be appended to the log.
///
/// The `event_type()` tag is stored next to the payload and is the only thing a
/// projection looks at when deciding whether it cares about an event.
///
/// # Serialization
///
/// Payloads are encoded with `bincode`. The default methods work for any type
/// implementing `Serialize` / `DeserializeOwned`.
pub trait Event: Send + Sync + 'static {
    /// Returns the stable type tag for this event (e.g. `"PlanCreated"`).
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were produced by a different type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// An event as it sits in the global log.
///
/// `global_sequence` is strictly increasing and unique across the whole store.
/// It is the only ordering key the engine relies on; `recorded_at` is
/// informational.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Identifier of the aggregate that produced the event.
    pub aggregate_id: String,

    /// Position of the event in the global log (first event is 1).
    pub global_sequence: u64,

    /// Explicit type tag (e.g. `"PlanCreated"`).
    pub event_type: String,

    /// The bincode-encoded payload.
    pub payload: Vec<u8>,

    /// When the event was committed.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Create a new recorded event.
    #[must_use]
    pub const fn new(
        aggregate_id: String,
        global_sequence: u64,
        event_type: String,
        payload: Vec<u8>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            aggregate_id,
            global_sequence,
            event_type,
            payload,
            recorded_at,
        }
    }

    /// Build a recorded event from a domain event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        aggregate_id: impl Into<String>,
        global_sequence: u64,
        event: &E,
    ) -> Result<Self, EventError> {
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            global_sequence,
            event_type: event.event_type().to_string(),
            payload: event.to_bytes()?,
            recorded_at: Utc::now(),
        })
    }

    /// Returns `true` if this event carries the given type tag.
    #[must_use]
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Decode the payload into a concrete type.
    ///
    /// Callers are expected to have matched on [`RecordedEvent::event_type`] first.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload is malformed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        bincode::deserialize(&self.payload).map_err(|e| {
            EventError::DeserializationError(format!(
                "{} at sequence {}: {e}",
                self.event_type, self.global_sequence
            ))
        })
    }
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordedEvent {{ sequence: {}, type: {}, aggregate: {}, size: {} bytes }}",
            self.global_sequence,
            self.event_type,
            self.aggregate_id,
            self.payload.len()
        )
    }
}
