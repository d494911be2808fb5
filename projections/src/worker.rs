//! Per-projection dispatch loop.
//!
//! One [`ProjectionWorker`] owns one projection's position. It is strictly
//! sequential: event `c + 1` is applied, its checkpoint advance committed, and
//! only then is `c + 2` looked at.
//!
//! # Unit of Work
//!
//! ```text
//! begin ──▶ advance(c → c+1) ──▶ projection.apply(event) ──▶ commit
//! ```
//!
//! The advance goes first. A second runner racing on the same projection is
//! rejected with a conflict before its `apply` writes anything, and a failed
//! `apply` rolls the advance back with the rest of the transaction.
//!
//! # Modes
//!
//! - **Catch-up**: while behind the head, events are read in pages through
//!   [`EventSource::replay_from`].
//! - **Live**: once caught up, [`EventSource::next_after`] is called whenever the
//!   source signals a commit (or the poll interval elapses).
//!
//! Rebuild is catch-up from sequence 1 after a reset.

use crate::config::RunnerConfig;
use crate::metrics;
use crate::retry::retry_with_predicate;
use futures::StreamExt;
use projector_core::{
    CheckpointStore, EventNotifications, EventSource, Projection, ProjectionError,
    ProjectionStatus, RecordedEvent, Result,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

/// What a single dispatch attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The event was applied and the checkpoint now equals this sequence.
    Applied(u64),
    /// Another writer moved the checkpoint; dispatch resumes from here.
    Resumed {
        /// Checkpoint re-read from the store.
        checkpoint: u64,
    },
    /// The source offered something other than `checkpoint + 1`. Nothing was
    /// applied.
    OutOfOrder {
        /// Sequence the projection needs next.
        expected: u64,
        /// Sequence the source returned.
        found: u64,
    },
    /// Nothing new to apply.
    Idle,
}

/// Operator request delivered to a running worker between events.
#[derive(Debug)]
pub enum Command {
    /// Reset checkpoint and tables, then replay the whole log.
    Rebuild(oneshot::Sender<Result<()>>),
    /// Clear a halt and try the failing event again.
    Retry(oneshot::Sender<Result<()>>),
    /// Clear a halt by advancing past the failing event without applying it.
    Skip(oneshot::Sender<Result<u64>>),
}

/// Drives one projection through the event log.
pub struct ProjectionWorker<S: CheckpointStore> {
    name: String,
    projection: Arc<dyn Projection<S>>,
    store: Arc<S>,
    source: Arc<dyn EventSource>,
    config: RunnerConfig,
    status: watch::Sender<ProjectionStatus>,
    checkpoint: u64,
    head: u64,
    rebuild_target: Option<u64>,
    halted_at: Option<u64>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S: CheckpointStore> ProjectionWorker<S> {
    /// Create a worker in the `Uninitialized` state.
    #[must_use]
    pub fn new(
        projection: Arc<dyn Projection<S>>,
        store: Arc<S>,
        source: Arc<dyn EventSource>,
        config: RunnerConfig,
    ) -> Self {
        let (status, _) = watch::channel(ProjectionStatus::Uninitialized);
        Self {
            name: projection.name().to_string(),
            projection,
            store,
            source,
            config,
            status,
            checkpoint: 0,
            head: 0,
            rebuild_target: None,
            halted_at: None,
            shutdown: None,
        }
    }

    /// Projection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checkpoint as last committed by this worker.
    #[must_use]
    pub const fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ProjectionStatus {
        self.status.borrow().clone()
    }

    /// Watch lifecycle status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProjectionStatus> {
        self.status.subscribe()
    }

    /// Set up derived tables and register the checkpoint row.
    ///
    /// Returns the checkpoint the projection resumes from.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Initialization`]; the status becomes `Failed`.
    pub async fn initialize(&mut self) -> Result<u64> {
        let result = match self.projection.initialize().await {
            Ok(()) => {
                retry_with_predicate(
                    &self.config.retry,
                    || self.store.register(&self.name),
                    ProjectionError::is_transient,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(checkpoint) => {
                self.checkpoint = checkpoint;
                tracing::info!(projection = %self.name, checkpoint, "Projection initialized");
                self.status
                    .send_replace(ProjectionStatus::Initialized { checkpoint });
                Ok(checkpoint)
            }
            Err(e) => {
                let error = match e {
                    ProjectionError::Initialization { .. } => e,
                    other => ProjectionError::Initialization {
                        projection: self.name.clone(),
                        reason: other.to_string(),
                    },
                };
                tracing::error!(projection = %self.name, error = %error, "Projection failed to initialize");
                self.status.send_replace(ProjectionStatus::Failed {
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Apply `event` if it is exactly `checkpoint + 1`.
    ///
    /// Transient failures are retried with the configured backoff. Any other
    /// failure halts the projection at `event`.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Transient`] once retries are exhausted (nothing consumed)
    /// - [`ProjectionError::Apply`] when the projection halted
    pub async fn dispatch(&mut self, event: &RecordedEvent) -> Result<DispatchOutcome> {
        let expected = self.checkpoint.saturating_add(1);
        if event.global_sequence != expected {
            tracing::warn!(
                projection = %self.name,
                checkpoint = self.checkpoint,
                sequence = event.global_sequence,
                "Next event is not contiguous with checkpoint, waiting"
            );
            self.head = self.head.max(event.global_sequence);
            self.publish();
            return Ok(DispatchOutcome::OutOfOrder {
                expected,
                found: event.global_sequence,
            });
        }

        let from = self.checkpoint;
        let started = Instant::now();
        let result = retry_with_predicate(
            &self.config.retry,
            || self.commit_event(from, event),
            |e: &ProjectionError| {
                let transient = e.is_transient();
                if transient {
                    metrics::record_transient_retry(&self.name);
                }
                transient
            },
        )
        .await;

        match result {
            Ok(()) => {
                metrics::record_applied(&self.name, started.elapsed());
                tracing::debug!(
                    projection = %self.name,
                    sequence = event.global_sequence,
                    event_type = %event.event_type,
                    "Event applied"
                );
                self.checkpoint = event.global_sequence;
                self.head = self.head.max(self.checkpoint);
                self.publish();
                Ok(DispatchOutcome::Applied(event.global_sequence))
            }
            Err(ProjectionError::Conflict {
                expected, actual, ..
            }) => {
                metrics::record_conflict(&self.name);
                tracing::warn!(
                    projection = %self.name,
                    expected,
                    actual,
                    "Checkpoint moved by another writer, resuming from stored value"
                );
                self.checkpoint = self.store.get(&self.name).await?;
                self.publish();
                Ok(DispatchOutcome::Resumed {
                    checkpoint: self.checkpoint,
                })
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                let error = e.into_apply(&self.name, event.global_sequence);
                self.halt(event.global_sequence, &error);
                Err(error)
            }
        }
    }

    async fn commit_event(&self, from: u64, event: &RecordedEvent) -> Result<()> {
        let mut tx = self.store.begin().await?;
        self.store
            .advance(&mut tx, &self.name, from, event.global_sequence)
            .await?;
        self.projection.apply(&mut tx, event).await?;
        self.store.commit(tx).await
    }

    /// Live mode: apply the event following the checkpoint, if committed.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch); read failures are transient.
    pub async fn dispatch_next(&mut self) -> Result<DispatchOutcome> {
        match self.source.next_after(self.checkpoint).await? {
            Some(event) => self.dispatch(&event).await,
            None => {
                self.head = self.checkpoint;
                self.publish();
                Ok(DispatchOutcome::Idle)
            }
        }
    }

    /// Catch-up mode: apply up to `limit` events from one replay page.
    ///
    /// Returns `Idle` when the page ran out before `limit` (the log is drained),
    /// otherwise the outcome of the last dispatch. A `limit` of 0 reads one
    /// event.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub async fn catch_up_batch(&mut self, limit: usize) -> Result<DispatchOutcome> {
        let limit = limit.max(1);
        self.head = self.source.head().await?.max(self.checkpoint);
        self.publish();

        let source = Arc::clone(&self.source);
        let mut events = source
            .replay_from(self.checkpoint.saturating_add(1))
            .take(limit);
        let mut seen = 0;

        while let Some(event) = events.next().await {
            let event = event?;
            seen += 1;

            let outcome = self.dispatch(&event).await?;
            if !matches!(outcome, DispatchOutcome::Applied(_)) || self.shutdown_requested() {
                return Ok(outcome);
            }
            if seen == limit {
                return Ok(outcome);
            }
        }

        self.head = self.checkpoint;
        self.publish();
        Ok(DispatchOutcome::Idle)
    }

    /// Apply every committed event after the checkpoint.
    ///
    /// Stops early on a gap or a shutdown request.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub async fn catch_up(&mut self) -> Result<DispatchOutcome> {
        loop {
            let outcome = self.catch_up_batch(self.config.replay_batch_size).await?;
            match outcome {
                DispatchOutcome::Applied(_) | DispatchOutcome::Resumed { .. }
                    if !self.shutdown_requested() => {}
                other => return Ok(other),
            }
        }
    }

    /// Reset the checkpoint to 0 and clear the projection's tables in one
    /// transaction, then mark the projection `Rebuilding` up to the current head.
    ///
    /// The replay itself happens through [`catch_up`](Self::catch_up) or the
    /// dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns error if the head cannot be read or the reset does not commit.
    pub async fn rebuild(&mut self) -> Result<()> {
        let target = self.source.head().await?;
        tracing::info!(projection = %self.name, target, "Rebuild started");

        retry_with_predicate(
            &self.config.retry,
            || self.reset_all(),
            ProjectionError::is_transient,
        )
        .await?;

        self.checkpoint = 0;
        self.head = target;
        self.halted_at = None;
        self.rebuild_target = Some(target);
        self.publish();
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        self.store.reset(&mut tx, &self.name).await?;
        self.projection.reset(&mut tx).await?;
        self.store.commit(tx).await
    }

    /// Lift a halt so the failing event is attempted again.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotHalted`] if the projection is not halted.
    pub fn retry(&mut self) -> Result<()> {
        let Some(failed) = self.halted_at.take() else {
            return Err(ProjectionError::NotHalted(self.name.clone()));
        };
        tracing::info!(projection = %self.name, sequence = failed, "Retrying halted event");
        self.publish();
        Ok(())
    }

    /// Lift a halt by advancing past the failing event with no table writes.
    ///
    /// Returns the skipped sequence.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::NotHalted`] if the projection is not halted
    /// - store errors if the advance does not commit
    pub async fn skip(&mut self) -> Result<u64> {
        let Some(failed) = self.halted_at else {
            return Err(ProjectionError::NotHalted(self.name.clone()));
        };
        let from = self.checkpoint;

        retry_with_predicate(
            &self.config.retry,
            || async {
                let mut tx = self.store.begin().await?;
                self.store.advance(&mut tx, &self.name, from, failed).await?;
                self.store.commit(tx).await
            },
            ProjectionError::is_transient,
        )
        .await?;

        metrics::record_skipped(&self.name);
        tracing::warn!(
            projection = %self.name,
            sequence = failed,
            "Operator skipped event, checkpoint advanced without applying it"
        );
        self.halted_at = None;
        self.checkpoint = failed;
        self.publish();
        Ok(failed)
    }

    fn halt(&mut self, failed_sequence: u64, error: &ProjectionError) {
        metrics::record_apply_failure(&self.name);
        tracing::error!(
            projection = %self.name,
            checkpoint = self.checkpoint,
            sequence = failed_sequence,
            error = %error,
            "Projection halted"
        );
        self.halted_at = Some(failed_sequence);
        self.status.send_replace(ProjectionStatus::Halted {
            checkpoint: self.checkpoint,
            failed_sequence,
            reason: error.to_string(),
        });
    }

    fn publish(&mut self) {
        let checkpoint = self.checkpoint;
        let head = self.head.max(checkpoint);

        let next = match self.rebuild_target {
            Some(target) if checkpoint < target => ProjectionStatus::Rebuilding { checkpoint, target },
            Some(target) => {
                tracing::info!(projection = %self.name, target, "Rebuild finished");
                self.rebuild_target = None;
                ProjectionStatus::CaughtUp { checkpoint }
            }
            None if checkpoint >= head => ProjectionStatus::CaughtUp { checkpoint },
            None => ProjectionStatus::Behind { checkpoint, head },
        };

        metrics::record_position(&self.name, checkpoint, head);
        let name = &self.name;
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if matches!(next, ProjectionStatus::CaughtUp { .. })
                && !matches!(current, ProjectionStatus::CaughtUp { .. })
            {
                tracing::info!(projection = %name, checkpoint, "Projection caught up");
            }
            *current = next;
            true
        });
    }

    fn is_caught_up(&self) -> bool {
        matches!(*self.status.borrow(), ProjectionStatus::CaughtUp { .. })
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller gave up waiting.
        match command {
            Command::Rebuild(reply) => {
                let _ = reply.send(self.rebuild().await);
            }
            Command::Retry(reply) => {
                let _ = reply.send(self.retry());
            }
            Command::Skip(reply) => {
                let _ = reply.send(self.skip().await);
            }
        }
    }

    async fn step(&mut self) -> bool {
        let outcome = if self.is_caught_up() {
            self.dispatch_next().await
        } else {
            self.catch_up_batch(self.config.replay_batch_size).await
        };

        match outcome {
            Ok(DispatchOutcome::Applied(_) | DispatchOutcome::Resumed { .. }) => true,
            Ok(DispatchOutcome::OutOfOrder { .. } | DispatchOutcome::Idle) => false,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    projection = %self.name,
                    checkpoint = self.checkpoint,
                    error = %e,
                    "Transient failure, will try again after poll interval"
                );
                false
            }
            // `dispatch` already halted the projection.
            Err(_) => false,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Commands are handled between events. The in-flight event, if any, is
    /// always committed or rolled back before the loop exits.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(projection = %self.name, checkpoint = self.checkpoint, "Projection starting");
        self.shutdown = Some(shutdown.clone());

        let mut notifications = match self.source.subscribe().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!(projection = %self.name, error = %e, "No commit notifications, polling");
                None
            }
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Ok(command) = commands.try_recv() {
                self.handle(command).await;
            }

            let halted = self.halted_at.is_some();
            if !halted && self.step().await {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                head = next_notification(notifications.as_mut()), if !halted => match head {
                    Some(head) => {
                        self.head = self.head.max(head);
                        self.publish();
                    }
                    None => {
                        tracing::warn!(projection = %self.name, "Commit notifications closed, polling");
                        notifications = None;
                    }
                },
                () = tokio::time::sleep(self.config.poll_interval), if !halted => {}
            }
        }

        tracing::info!(projection = %self.name, checkpoint = self.checkpoint, "Projection stopped");
        self.status.send_replace(ProjectionStatus::Stopped {
            checkpoint: self.checkpoint,
        });
    }
}

async fn next_notification(rx: Option<&mut EventNotifications>) -> Option<u64> {
    match rx {
        Some(rx) => {
            rx.changed().await.ok()?;
            Some(*rx.borrow_and_update())
        }
        None => std::future::pending().await,
    }
}
