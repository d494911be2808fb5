//! Projection runner for Projector.
//!
//! # Overview
//!
//! This crate drives [`Projection`](projector_core::Projection)s through the
//! global event log:
//! - **Ordered dispatch**: event `c + 1` only, never out of order, never skipped
//! - **Atomic checkpointing**: checkpoint advance and table writes share one transaction
//! - **Catch-up and live modes**: paged replay while behind, commit notifications once caught up
//! - **Rebuild**: reset to 0, clear tables, replay, resume
//! - **Operator controls**: retry or skip a halted projection, inspect status and lag
//!
//! # Failure Policy
//!
//! ```text
//! Transient  → retry with backoff (RetryPolicy), event not consumed
//! Conflict   → re-read checkpoint, resume from there
//! Apply      → halt at the failing sequence until retry/skip
//! Init       → projection never starts, the rest run normally
//! ```
//!
//! # Example
//!
//! ```ignore
//! use projector_projections::{ProjectionRunner, RunnerConfig};
//!
//! let mut runner = ProjectionRunner::new(source, store, RunnerConfig::from_env()?)?;
//! runner.register(Arc::new(PlansQuery::new(table)))?;
//! runner.initialize_all().await;
//!
//! let handle = runner.start().await;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

pub mod config;
pub mod metrics;
pub mod retry;
pub mod runner;
pub mod worker;

pub use config::{ConfigError, RunnerConfig};
pub use metrics::MetricsServer;
pub use retry::RetryPolicy;
pub use runner::{CheckpointReport, ProjectionRunner, RunnerHandle};
pub use worker::{Command, DispatchOutcome, ProjectionWorker};
