//! # Projector Testing
//!
//! In-memory backends and helpers for testing projections and the runner.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: an ordered [`EventSource`](projector_core::EventSource)
//!   with commit notifications, gap injection and read-failure injection
//! - [`InMemoryCheckpointStore`]: a transactional, conflict-detecting
//!   [`CheckpointStore`](projector_core::CheckpointStore)
//! - [`InMemoryTransaction`]: buffers checkpoint moves and table writes until commit
//! - [`ProjectionTestHarness`]: fluent API for testing one projection
//!
//! ## Example
//!
//! ```ignore
//! use projector_testing::ProjectionTestHarness;
//!
//! #[tokio::test]
//! async fn records_plan() {
//!     let table = Arc::new(InMemoryPlanTable::default());
//!     let mut harness = ProjectionTestHarness::new(PlansQuery::new(table)).await.unwrap();
//!
//!     harness.given_event("p1", &created("p1")).await.unwrap();
//!     harness.then_checkpoint_is(1).await;
//! }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

mod checkpoint_store;
mod event_log;
mod harness;

pub use checkpoint_store::{InMemoryCheckpointStore, InMemoryTransaction};
pub use event_log::InMemoryEventLog;
pub use harness::ProjectionTestHarness;

/// Install a `tracing` subscriber for test output, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
