//! Projection runner: registration, startup and operator controls.
//!
//! The runner wires every registered projection to the shared event source and
//! checkpoint store, then spawns one [`ProjectionWorker`] task per projection.
//! Projections share nothing but the read-only source, so a halted or failed
//! projection never holds the others back.
//!
//! # Example
//!
//! ```ignore
//! let mut runner = ProjectionRunner::new(source, store, RunnerConfig::from_env()?)?;
//! runner.register(Arc::new(PlansQuery::new(table)))?;
//!
//! for failure in runner.initialize_all().await {
//!     tracing::error!(error = %failure, "projection will not start");
//! }
//!
//! let handle = runner.start().await;
//! handle.wait_until_caught_up("plans_query", head).await?;
//! handle.shutdown().await;
//! ```

use crate::config::{ConfigError, RunnerConfig};
use crate::worker::{Command, ProjectionWorker};
use projector_core::{
    Checkpoint, CheckpointStore, EventSource, Projection, ProjectionError, ProjectionStatus,
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Commands queued per projection before the sender waits.
const COMMAND_BUFFER: usize = 16;

/// Checkpoint with its distance from the head of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointReport {
    /// The stored checkpoint.
    pub checkpoint: Checkpoint,
    /// Head of the log when the report was taken.
    pub head: u64,
    /// `head - last_applied_sequence`.
    pub lag: u64,
}

/// Registers projections and starts their dispatch loops.
pub struct ProjectionRunner<S: CheckpointStore> {
    source: Arc<dyn EventSource>,
    store: Arc<S>,
    config: RunnerConfig,
    workers: Vec<ProjectionWorker<S>>,
}

impl<S: CheckpointStore> ProjectionRunner<S> {
    /// Create a runner over one event source and one checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if `config` fails
    /// [`RunnerConfig::validate`].
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<S>,
        config: RunnerConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source,
            store,
            config,
            workers: Vec::new(),
        })
    }

    /// Add a projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::DuplicateProjection`] if the name is taken.
    pub fn register(&mut self, projection: Arc<dyn Projection<S>>) -> Result<()> {
        let name = projection.name().to_string();
        if self.workers.iter().any(|w| w.name() == name) {
            return Err(ProjectionError::DuplicateProjection(name));
        }

        tracing::debug!(projection = %name, "Projection registered");
        self.workers.push(ProjectionWorker::new(
            projection,
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            self.config.clone(),
        ));
        Ok(())
    }

    /// Registered projection names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name().to_string()).collect()
    }

    /// Initialize every projection that has not been initialized yet.
    ///
    /// A failing projection is marked `Failed` and will not start; the others
    /// are unaffected. Returns the failures.
    pub async fn initialize_all(&mut self) -> Vec<ProjectionError> {
        let mut failures = Vec::new();
        for worker in &mut self.workers {
            if worker.status() != ProjectionStatus::Uninitialized {
                continue;
            }
            if let Err(e) = worker.initialize().await {
                failures.push(e);
            }
        }
        failures
    }

    /// Spawn a dispatch task for every initialized projection.
    ///
    /// Projections still `Uninitialized` are initialized first. Must be called
    /// from within a Tokio runtime.
    pub async fn start(mut self) -> RunnerHandle<S> {
        self.initialize_all().await;

        let (shutdown, _) = watch::channel(false);
        let mut projections = BTreeMap::new();
        let mut tasks = Vec::new();
        let mut parked = Vec::new();

        for worker in self.workers {
            let name = worker.name().to_string();
            let status = worker.subscribe();

            if matches!(worker.status(), ProjectionStatus::Initialized { .. }) {
                let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
                tasks.push(tokio::spawn(worker.run(rx, shutdown.subscribe())));
                projections.insert(
                    name,
                    Entry {
                        status,
                        commands: Some(tx),
                    },
                );
            } else {
                projections.insert(
                    name,
                    Entry {
                        status,
                        commands: None,
                    },
                );
                parked.push(worker);
            }
        }

        tracing::info!(
            running = tasks.len(),
            failed = parked.len(),
            "Projection runner started"
        );

        RunnerHandle {
            source: self.source,
            store: self.store,
            projections,
            shutdown,
            tasks,
            _parked: parked,
        }
    }
}

struct Entry {
    status: watch::Receiver<ProjectionStatus>,
    commands: Option<mpsc::Sender<Command>>,
}

/// Control surface for running projections.
pub struct RunnerHandle<S: CheckpointStore> {
    source: Arc<dyn EventSource>,
    store: Arc<S>,
    projections: BTreeMap<String, Entry>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    // Keeps the status of projections that never started readable.
    _parked: Vec<ProjectionWorker<S>>,
}

impl<S: CheckpointStore> RunnerHandle<S> {
    /// Registered projection names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.projections.keys().cloned().collect()
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.projections
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
    }

    /// Current status of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::UnknownProjection`] for unregistered names.
    pub fn status(&self, name: &str) -> Result<ProjectionStatus> {
        Ok(self.entry(name)?.status.borrow().clone())
    }

    /// Status of every projection, sorted by name.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, ProjectionStatus)> {
        self.projections
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.borrow().clone()))
            .collect()
    }

    /// Stored checkpoints with lag against the current head.
    ///
    /// # Errors
    ///
    /// Returns error if the store or the source cannot be read.
    pub async fn checkpoints(&self) -> Result<Vec<CheckpointReport>> {
        let head = self.source.head().await?;
        let checkpoints = self.store.list().await?;
        Ok(checkpoints
            .into_iter()
            .map(|checkpoint| CheckpointReport {
                lag: checkpoint.lag(head),
                checkpoint,
                head,
            })
            .collect())
    }

    /// Committed events `name` has not applied yet.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the store cannot be read.
    pub async fn lag(&self, name: &str) -> Result<u64> {
        self.entry(name)?;
        let head = self.source.head().await?;
        let checkpoint = self.store.get(name).await?;
        Ok(head.saturating_sub(checkpoint))
    }

    async fn send<T>(
        &self,
        name: &str,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let entry = self.entry(name)?;
        let Some(commands) = &entry.commands else {
            let reason = match &*entry.status.borrow() {
                ProjectionStatus::Failed { reason } => reason.clone(),
                other => format!("not running ({other:?})"),
            };
            return Err(ProjectionError::Initialization {
                projection: name.to_string(),
                reason,
            });
        };

        let (tx, rx) = oneshot::channel();
        commands
            .send(command(tx))
            .await
            .map_err(|_| ProjectionError::ShuttingDown)?;
        rx.await.map_err(|_| ProjectionError::ShuttingDown)?
    }

    /// Reset `name` to sequence 0, clear its tables and replay the log.
    ///
    /// Returns once the reset has committed; progress is visible through
    /// [`status`](Self::status) as `Rebuilding` and then `CaughtUp`.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown, the projection is not running, or
    /// the reset failed.
    pub async fn rebuild(&self, name: &str) -> Result<()> {
        tracing::info!(projection = %name, "Rebuild requested");
        self.send(name, Command::Rebuild).await
    }

    /// Retry the event a halted projection failed on.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotHalted`] if `name` is not halted.
    pub async fn retry(&self, name: &str) -> Result<()> {
        self.send(name, Command::Retry).await
    }

    /// Skip the event a halted projection failed on. Returns its sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotHalted`] if `name` is not halted.
    pub async fn skip(&self, name: &str) -> Result<u64> {
        self.send(name, Command::Skip).await
    }

    /// Wait until the status of `name` satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the projection stopped before
    /// the predicate held.
    pub async fn wait_for<F>(&self, name: &str, predicate: F) -> Result<ProjectionStatus>
    where
        F: FnMut(&ProjectionStatus) -> bool,
    {
        let mut status = self.entry(name)?.status.clone();
        let current = status
            .wait_for(predicate)
            .await
            .map_err(|_| ProjectionError::ShuttingDown)?;
        Ok(current.clone())
    }

    /// Wait until `name` has applied everything up to `sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Apply`] if the projection halts first, or
    /// [`ProjectionError::Initialization`] if it never started.
    pub async fn wait_until_caught_up(&self, name: &str, sequence: u64) -> Result<u64> {
        let status = self
            .wait_for(name, |s| {
                s.is_caught_up_to(sequence)
                    || s.is_halted()
                    || matches!(s, ProjectionStatus::Failed { .. })
            })
            .await?;

        match status {
            ProjectionStatus::CaughtUp { checkpoint } => Ok(checkpoint),
            ProjectionStatus::Halted {
                failed_sequence,
                reason,
                ..
            } => Err(ProjectionError::Apply {
                projection: name.to_string(),
                sequence: failed_sequence,
                reason,
            }),
            ProjectionStatus::Failed { reason } => Err(ProjectionError::Initialization {
                projection: name.to_string(),
                reason,
            }),
            other => Err(ProjectionError::Other(format!(
                "unexpected status {other:?}"
            ))),
        }
    }

    /// Stop every dispatch loop between events and wait for them to exit.
    pub async fn shutdown(self) {
        tracing::info!("Projection runner shutting down");
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Projection task panicked");
            }
        }
        tracing::info!("Projection runner stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use projector_core::{BoxFuture, RecordedEvent};
    use projector_testing::{InMemoryCheckpointStore, InMemoryEventLog, InMemoryTransaction};
    use std::time::Duration;

    struct Named {
        name: &'static str,
        fail_init: bool,
    }

    impl Projection<InMemoryCheckpointStore> for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&self) -> BoxFuture<'_, Result<()>> {
            let fail = self.fail_init;
            Box::pin(async move {
                if fail {
                    Err(ProjectionError::Storage("no such schema".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn reset<'a>(&'a self, _tx: &'a mut InMemoryTransaction) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn apply<'a>(
            &'a self,
            _tx: &'a mut InMemoryTransaction,
            _event: &'a RecordedEvent,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn runner(log: &Arc<InMemoryEventLog>) -> ProjectionRunner<InMemoryCheckpointStore> {
        ProjectionRunner::new(
            Arc::clone(log) as Arc<dyn EventSource>,
            Arc::new(InMemoryCheckpointStore::new()),
            RunnerConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let log = Arc::new(InMemoryEventLog::new());
        let new = |config: RunnerConfig| {
            ProjectionRunner::new(
                Arc::clone(&log) as Arc<dyn EventSource>,
                Arc::new(InMemoryCheckpointStore::new()),
                config,
            )
        };

        assert!(matches!(
            new(RunnerConfig::default().with_replay_batch_size(0)),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            new(RunnerConfig::default().with_poll_interval(Duration::ZERO)),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(new(RunnerConfig::default()).is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut runner = runner(&log);
        runner
            .register(Arc::new(Named {
                name: "a",
                fail_init: false,
            }))
            .unwrap();

        let error = runner
            .register(Arc::new(Named {
                name: "a",
                fail_init: false,
            }))
            .unwrap_err();
        assert!(matches!(error, ProjectionError::DuplicateProjection(n) if n == "a"));
        assert_eq!(runner.names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn failed_initialization_only_affects_its_projection() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("x", "Tick", Vec::new());
        let mut runner = runner(&log);
        runner
            .register(Arc::new(Named {
                name: "broken",
                fail_init: true,
            }))
            .unwrap();
        runner
            .register(Arc::new(Named {
                name: "healthy",
                fail_init: false,
            }))
            .unwrap();

        let failures = runner.initialize_all().await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            ProjectionError::Initialization { projection, .. } if projection == "broken"
        ));

        let handle = runner.start().await;
        assert_eq!(handle.wait_until_caught_up("healthy", 1).await.unwrap(), 1);
        assert!(matches!(
            handle.status("broken").unwrap(),
            ProjectionStatus::Failed { .. }
        ));
        assert!(matches!(
            handle.rebuild("broken").await,
            Err(ProjectionError::Initialization { .. })
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_projection_is_reported() {
        let log = Arc::new(InMemoryEventLog::new());
        let handle = runner(&log).start().await;

        assert!(matches!(
            handle.status("nope"),
            Err(ProjectionError::UnknownProjection(_))
        ));
        assert!(matches!(
            handle.skip("nope").await,
            Err(ProjectionError::UnknownProjection(_))
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn checkpoints_report_lag() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut runner = runner(&log);
        runner
            .register(Arc::new(Named {
                name: "a",
                fail_init: false,
            }))
            .unwrap();
        let handle = runner.start().await;

        for _ in 0..3 {
            log.append("x", "Tick", Vec::new());
        }
        handle.wait_until_caught_up("a", 3).await.unwrap();

        let reports = handle.checkpoints().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].checkpoint.last_applied_sequence, 3);
        assert_eq!(reports[0].lag, 0);
        assert_eq!(handle.lag("a").await.unwrap(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_marks_projections_stopped() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut runner = runner(&log);
        runner
            .register(Arc::new(Named {
                name: "a",
                fail_init: false,
            }))
            .unwrap();
        let handle = runner.start().await;
        let mut status = handle.entry("a").unwrap().status.clone();

        handle.shutdown().await;

        let last = status.borrow_and_update().clone();
        assert!(matches!(last, ProjectionStatus::Stopped { .. }));
    }
}
