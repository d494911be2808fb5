//! Projection contract, error taxonomy and lifecycle status.
//!
//! # Overview
//!
//! A projection is a named consumer that derives read-optimized tables from the
//! global event log. It owns its tables outright: only its `apply` step writes
//! them, anyone may read them.
//!
//! The projection itself holds no position. The runner reads the checkpoint,
//! opens a transaction, advances the checkpoint and calls
//! [`Projection::apply`] with that same transaction. A projection only has to
//! turn one event into zero or more writes.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──▶ Behind ◀──▶ CaughtUp
//!                                                 │  ▲          │
//!                                       apply err │  │ retry/   │ rebuild
//!                                                 ▼  │ skip     ▼
//!                                               Halted      Rebuilding ──▶ CaughtUp
//! ```
//!
//! ## Example
//!
//! ```ignore
//! impl<S> Projection<S> for PlansQuery<T>
//! where
//!     S: CheckpointStore,
//!     T: PlanTableWriter<S::Transaction>,
//! {
//!     fn name(&self) -> &str {
//!         "plans_query"
//!     }
//!
//!     fn apply<'a>(&'a self, tx: &'a mut S::Transaction, event: &'a RecordedEvent)
//!         -> BoxFuture<'a, Result<()>>
//!     {
//!         Box::pin(async move {
//!             match event.event_type.as_str() {
//!                 "PlanCreated" => self.table.insert(tx, &plan).await,
//!                 _ => Ok(()), // not ours
//!             }
//!         })
//!     }
//!     // ...
//! }
//! ```

use crate::BoxFuture;
use crate::checkpoint::CheckpointStore;
use crate::event::{EventError, RecordedEvent};
use crate::event_source::EventSourceError;
use serde::{Deserialize, Serialize};

/// Error type for projection operations.
///
/// The runner's policy is driven by the variant:
///
/// | Variant          | Runner reaction                                       |
/// |------------------|-------------------------------------------------------|
/// | `Transient`      | retry with backoff, event not consumed                |
/// | `Conflict`       | re-read checkpoint and resume, not a failure          |
/// | `Apply` and rest | halt this projection at the failing sequence          |
/// | `Initialization` | projection never starts, others are unaffected        |
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectionError {
    /// Table write, checkpoint store or event source temporarily unavailable.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Checkpoint advance precondition failed.
    #[error("Checkpoint conflict for '{projection}': expected {expected}, found {actual}")]
    Conflict {
        /// Projection whose checkpoint moved.
        projection: String,
        /// Value the caller expected.
        expected: u64,
        /// Value actually stored.
        actual: u64,
    },

    /// Domain transformation failed (malformed payload, rejected write...).
    #[error("Failed to apply event {sequence} to '{projection}': {reason}")]
    Apply {
        /// Projection that failed.
        projection: String,
        /// Sequence of the failing event.
        sequence: u64,
        /// What went wrong.
        reason: String,
    },

    /// Table or schema setup failed.
    #[error("Failed to initialize '{projection}': {reason}")]
    Initialization {
        /// Projection that failed.
        projection: String,
        /// What went wrong.
        reason: String,
    },

    /// Non-transient storage error (constraint violation, bad SQL...).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload encoding or decoding error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No projection registered under this name.
    #[error("Unknown projection: {0}")]
    UnknownProjection(String),

    /// A projection with this name is already registered.
    #[error("Projection already registered: {0}")]
    DuplicateProjection(String),

    /// Operator action that requires a halted projection.
    #[error("Projection '{0}' is not halted")]
    NotHalted(String),

    /// The runner is stopping and no longer accepts commands.
    #[error("Projection runner is shutting down")]
    ShuttingDown,

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl ProjectionError {
    /// Returns `true` for errors that should be retried with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` for checkpoint precondition failures.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Build an [`ProjectionError::Apply`] for `event`.
    #[must_use]
    pub fn apply(projection: &str, event: &RecordedEvent, reason: impl ToString) -> Self {
        Self::Apply {
            projection: projection.to_string(),
            sequence: event.global_sequence,
            reason: reason.to_string(),
        }
    }

    /// Attach projection and sequence context to a terminal error.
    ///
    /// `Apply` errors are returned unchanged; transient errors and conflicts are
    /// not terminal and are also left alone.
    #[must_use]
    pub fn into_apply(self, projection: &str, sequence: u64) -> Self {
        match self {
            Self::Apply { .. } | Self::Transient(_) | Self::Conflict { .. } => self,
            other => Self::Apply {
                projection: projection.to_string(),
                sequence,
                reason: other.to_string(),
            },
        }
    }
}

impl From<EventSourceError> for ProjectionError {
    fn from(error: EventSourceError) -> Self {
        Self::Transient(error.to_string())
    }
}

impl From<EventError> for ProjectionError {
    fn from(error: EventError) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A named transformation from events to its own derived tables.
///
/// # Contract
///
/// - [`name`](Projection::name) is stable: it keys the checkpoint row. Renaming
///   a projection creates a new one with no history.
/// - [`initialize`](Projection::initialize) is idempotent and safe on every startup.
/// - [`apply`](Projection::apply) writes only through `tx`, is a no-op for event
///   types it does not recognize, and may be retried. It can assume strictly
///   increasing `global_sequence` and nothing else.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the runner can hold a heterogeneous set of
/// `Arc<dyn Projection<S>>` for one backend `S`.
pub trait Projection<S: CheckpointStore>: Send + Sync {
    /// Stable unique identifier.
    fn name(&self) -> &str;

    /// Create derived tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Initialization`] if setup fails.
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    /// Clear every derived table inside `tx`. Called by rebuild together with
    /// the checkpoint reset.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the tables cannot be cleared.
    fn reset<'a>(&'a self, tx: &'a mut S::Transaction) -> BoxFuture<'a, Result<()>>;

    /// Apply one event inside `tx`.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Transient`] if a table write hit an unavailable store
    /// - [`ProjectionError::Apply`] for anything that retrying will not fix
    fn apply<'a>(
        &'a self,
        tx: &'a mut S::Transaction,
        event: &'a RecordedEvent,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Where a projection sits in its lifecycle.
///
/// Published by the runner for operational visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectionStatus {
    /// Registered, tables not set up yet.
    Uninitialized,
    /// Tables exist and the checkpoint row is registered.
    Initialized {
        /// Current checkpoint.
        checkpoint: u64,
    },
    /// Draining backlog.
    Behind {
        /// Current checkpoint.
        checkpoint: u64,
        /// Head of the log when last observed.
        head: u64,
    },
    /// Applied everything committed so far.
    CaughtUp {
        /// Current checkpoint.
        checkpoint: u64,
    },
    /// Replaying the full log after an operator-requested rebuild.
    Rebuilding {
        /// Current checkpoint.
        checkpoint: u64,
        /// Head of the log when the rebuild started.
        target: u64,
    },
    /// Stopped at a failing event until an operator retries or skips it.
    Halted {
        /// Current checkpoint (last good event).
        checkpoint: u64,
        /// Sequence of the event that failed.
        failed_sequence: u64,
        /// Error message.
        reason: String,
    },
    /// Initialization failed; the projection never started.
    Failed {
        /// Error message.
        reason: String,
    },
    /// Dispatch loop exited after a shutdown request.
    Stopped {
        /// Checkpoint at shutdown.
        checkpoint: u64,
    },
}

impl ProjectionStatus {
    /// Checkpoint carried by the status, if any.
    #[must_use]
    pub const fn checkpoint(&self) -> Option<u64> {
        match self {
            Self::Initialized { checkpoint }
            | Self::Behind { checkpoint, .. }
            | Self::CaughtUp { checkpoint }
            | Self::Rebuilding { checkpoint, .. }
            | Self::Halted { checkpoint, .. }
            | Self::Stopped { checkpoint } => Some(*checkpoint),
            Self::Uninitialized | Self::Failed { .. } => None,
        }
    }

    /// Returns `true` when the projection has applied everything up to `sequence`.
    #[must_use]
    pub const fn is_caught_up_to(&self, sequence: u64) -> bool {
        matches!(self, Self::CaughtUp { checkpoint } if *checkpoint >= sequence)
    }

    /// Returns `true` while the projection is halted on a failing event.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}
