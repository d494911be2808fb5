//! # Projector Core
//!
//! Core traits and types for materializing read models from an ordered event log.
//!
//! This crate defines the seams of the projection engine. It contains no I/O:
//! backends (`PostgreSQL`, in-memory) implement the traits, and the runner in
//! `projector-projections` drives them.
//!
//! ## Core Concepts
//!
//! - **Event**: An immutable fact with a strictly increasing `global_sequence`
//! - **Event Source**: Read-only access to the global log (`next_after`, `replay_from`, `subscribe`)
//! - **Checkpoint Store**: Per-projection `last_applied_sequence` with conditional advance
//! - **Projection**: A named transformation that writes its own tables inside the
//!   transaction that also advances its checkpoint
//!
//! ## Data Flow
//!
//! ```text
//! ┌──────────────┐   next_after / replay_from   ┌──────────────┐
//! │ Event Source │ ───────────────────────────▶ │    Runner    │
//! └──────────────┘                              └──────┬───────┘
//!                                                      │ one transaction per event
//!                                   ┌──────────────────┴──────────────────┐
//!                                   ▼                                     ▼
//!                          ┌─────────────────┐                  ┌──────────────────┐
//!                          │ Projection.apply│                  │ Checkpoint.advance│
//!                          │ (own tables)    │                  │ (c → c+1)         │
//!                          └─────────────────┘                  └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use projector_core::projection::{Projection, Result};
//!
//! impl<S: CheckpointStore> Projection<S> for AuditTrail {
//!     fn name(&self) -> &str {
//!         "audit_trail"
//!     }
//!
//!     fn apply<'a>(
//!         &'a self,
//!         tx: &'a mut S::Transaction,
//!         event: &'a RecordedEvent,
//!     ) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             match event.event_type.as_str() {
//!                 "UserRegistered" => self.table.insert(tx, event).await,
//!                 _ => Ok(()),
//!             }
//!         })
//!     }
//!     // ...
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Checkpoint store trait and checkpoint records
pub mod checkpoint;

/// Event trait and the recorded event envelope
pub mod event;

/// Event source adapter trait (read side of the event store)
pub mod event_source;

/// Projection trait, error taxonomy and lifecycle status
pub mod projection;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use event::{Event, EventError, RecordedEvent};
pub use event_source::{EventNotifications, EventSource, EventSourceError};
pub use projection::{Projection, ProjectionError, ProjectionStatus, Result};

/// Boxed future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
