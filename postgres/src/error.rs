//! Mapping from `sqlx` errors to the projection error taxonomy.

use projector_core::{EventSourceError, ProjectionError};

/// Returns `true` for database errors worth retrying: lost connections, pool
/// exhaustion, serialization failures and deadlocks.
#[must_use]
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            // serialization_failure, deadlock_detected, admin/crash shutdown,
            // cannot_connect_now, connection exceptions
            Some("40001" | "40P01" | "57P01" | "57P02" | "57P03" | "08000" | "08003" | "08006")
        ),
        _ => false,
    }
}

/// Classify a `sqlx` error as [`ProjectionError::Transient`] or
/// [`ProjectionError::Storage`], prefixed with `context`.
///
/// Projections writing their own tables use this so retries behave the same
/// as for checkpoint writes.
#[must_use]
pub fn projection_error(context: &str, error: &sqlx::Error) -> ProjectionError {
    if is_transient(error) {
        ProjectionError::Transient(format!("{context}: {error}"))
    } else {
        ProjectionError::Storage(format!("{context}: {error}"))
    }
}

pub(crate) fn source_error(context: &str, error: &sqlx::Error) -> EventSourceError {
    EventSourceError::Database(format!("{context}: {error}"))
}
