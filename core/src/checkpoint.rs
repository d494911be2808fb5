//! Checkpoint tracking for projection progress through the global log.
//!
//! A checkpoint is a single integer per projection: the `global_sequence` of the
//! last event the projection applied. 0 means it has never run.
//!
//! # Conditional Advance
//!
//! Checkpoints never move by blind overwrite. [`CheckpointStore::advance`] takes
//! the value the caller expects to find and fails with
//! [`ProjectionError::Conflict`] when the stored value differs. That one check
//! gives the engine both ordering (nobody advances from a stale position) and a
//! single-writer lock per projection (a racing runner loses and backs off).
//!
//! # Transactions
//!
//! Every mutating method takes the store's transaction. The runner opens one
//! transaction per event, hands the same transaction to the projection's
//! `apply`, and commits once. Table writes and checkpoint movement therefore
//! land together or not at all.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = store.begin().await?;
//! store.advance(&mut tx, "plans_query", 41, 42).await?;
//! projection.apply(&mut tx, &event).await?;
//! store.commit(tx).await?;
//! ```

use crate::projection::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// A projection's durable read position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Projection name (the durable key).
    pub projection_name: String,

    /// `global_sequence` of the last applied event (0 = never run).
    pub last_applied_sequence: u64,

    /// When the checkpoint last moved.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A fresh checkpoint at sequence 0.
    #[must_use]
    pub fn beginning(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            last_applied_sequence: 0,
            updated_at: Utc::now(),
        }
    }

    /// Number of committed events this projection has not applied yet.
    #[must_use]
    pub const fn lag(&self, head: u64) -> u64 {
        head.saturating_sub(self.last_applied_sequence)
    }
}

/// Durable `projection_name -> last_applied_sequence` mapping.
///
/// Implementations are used generically by the runner, so the transaction type
/// is an associated type rather than a trait object.
///
/// # Implementations
///
/// - `PostgresCheckpointStore` (in `projector-postgres`)
/// - `InMemoryCheckpointStore` (in `projector-testing`)
pub trait CheckpointStore: Send + Sync + 'static {
    /// The unit of work shared by checkpoint movement and table writes.
    ///
    /// Dropping a transaction without committing discards every write in it.
    type Transaction: Send + 'static;

    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] if the store is unavailable.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;

    /// Commit a transaction.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Conflict`] if another writer moved a checkpoint this
    ///   transaction advanced
    /// - [`ProjectionError::Transient`] if the commit could not reach the store
    fn commit(&self, tx: Self::Transaction) -> impl Future<Output = Result<()>> + Send;

    /// Create the checkpoint at 0 if it does not exist and return its value.
    ///
    /// Idempotent; called for every projection on startup.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] if the store is unavailable.
    fn register(&self, projection_name: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Committed `last_applied_sequence`, or 0 if the projection never ran.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] if the store is unavailable.
    fn get(&self, projection_name: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Move the checkpoint from `from` to `to` inside `tx`.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Conflict`] if the stored value is not `from`
    /// - [`ProjectionError::Transient`] if the store is unavailable
    fn advance(
        &self,
        tx: &mut Self::Transaction,
        projection_name: &str,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Put the checkpoint back to 0 inside `tx`. Only used by rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] if the store is unavailable.
    fn reset(
        &self,
        tx: &mut Self::Transaction,
        projection_name: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Every known checkpoint, ordered by projection name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Transient`] if the store is unavailable.
    fn list(&self) -> impl Future<Output = Result<Vec<Checkpoint>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beginning_starts_at_zero() {
        let checkpoint = Checkpoint::beginning("plans_query");
        assert_eq!(checkpoint.projection_name, "plans_query");
        assert_eq!(checkpoint.last_applied_sequence, 0);
    }

    #[test]
    fn lag_saturates() {
        let mut checkpoint = Checkpoint::beginning("plans_query");
        checkpoint.last_applied_sequence = 10;

        assert_eq!(checkpoint.lag(15), 5);
        assert_eq!(checkpoint.lag(10), 0);
        assert_eq!(checkpoint.lag(3), 0);
    }
}
