//! `PostgreSQL` backend for projector.
//!
//! This crate provides the production implementations of the two seams in
//! `projector-core`:
//!
//! - [`PostgresCheckpointStore`]: `projection_checkpoints` table with a
//!   conditional `UPDATE` for advance; its transaction is a plain
//!   `sqlx::Transaction`, so projection tables written in the same
//!   transaction commit atomically with the checkpoint
//! - [`PostgresEventSource`]: reads the `events` table, pages replay, and turns
//!   `LISTEN/NOTIFY` into commit notifications
//!
//! # Example
//!
//! ```ignore
//! use projector_postgres::{PostgresCheckpointStore, PostgresEventSource};
//!
//! let pool = PgPool::connect(&database_url).await?;
//! let store = PostgresCheckpointStore::new(pool.clone());
//! store.migrate().await?;
//!
//! let source = PostgresEventSource::new(pool);
//! let runner = ProjectionRunner::new(Arc::new(source), Arc::new(store), config)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod error;
mod event_source;

pub use checkpoint::PostgresCheckpointStore;
pub use error::{is_transient, projection_error};
pub use event_source::{DEFAULT_CHANNEL, PostgresEventSource};

/// `PostgreSQL` has no unsigned integers; sequences are stored as `BIGINT`.
///
/// Wrapping would occur at 2^63 events, which is acceptable.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn to_db(sequence: u64) -> i64 {
    sequence as i64
}

/// Inverse of [`to_db`]. Columns carry a `CHECK (>= 0)` constraint.
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn from_db(sequence: i64) -> u64 {
    sequence as u64
}
