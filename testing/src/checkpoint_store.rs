//! In-memory checkpoint store with real transaction semantics.

use chrono::Utc;
use projector_core::{Checkpoint, CheckpointStore, ProjectionError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CheckpointOp {
    Advance { name: String, from: u64, to: u64 },
    Reset { name: String },
}

type StagedWrite = Box<dyn FnOnce() + Send>;

/// Unit of work for [`InMemoryCheckpointStore`].
///
/// Checkpoint movements and table writes are buffered and only take effect
/// on commit. Dropping the transaction discards them, which is how a failing
/// `apply` rolls back its checkpoint advance.
///
/// In-memory tables write through [`stage`](Self::stage):
///
/// ```
/// use projector_testing::InMemoryTransaction;
/// use std::sync::{Arc, Mutex};
///
/// let rows = Arc::new(Mutex::new(Vec::new()));
/// let mut tx = InMemoryTransaction::default();
///
/// let target = Arc::clone(&rows);
/// tx.stage(move || target.lock().unwrap().push("p1"));
///
/// assert!(rows.lock().unwrap().is_empty()); // not committed yet
/// ```
#[derive(Default)]
pub struct InMemoryTransaction {
    ops: Vec<CheckpointOp>,
    staged: Vec<StagedWrite>,
}

impl InMemoryTransaction {
    /// Buffer a table write until commit.
    pub fn stage(&mut self, write: impl FnOnce() + Send + 'static) {
        self.staged.push(Box::new(write));
    }

    /// Number of buffered table writes.
    #[must_use]
    pub fn staged_writes(&self) -> usize {
        self.staged.len()
    }
}

impl fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("ops", &self.ops)
            .field("staged_writes", &self.staged.len())
            .finish()
    }
}

/// Checkpoint store backed by a `BTreeMap`.
///
/// `advance` fails fast on a stale `from`, and commit re-checks every advance
/// under a single lock. Two transactions racing on the same checkpoint can
/// therefore both get past `advance`, but only the first to commit wins; the
/// second gets [`ProjectionError::Conflict`] and none of its staged writes run.
///
/// # Example
///
/// ```
/// use projector_testing::InMemoryCheckpointStore;
/// use projector_core::CheckpointStore;
///
/// # async fn example() -> projector_core::Result<()> {
/// let store = InMemoryCheckpointStore::new();
/// store.register("plans_query").await?;
///
/// let mut tx = store.begin().await?;
/// store.advance(&mut tx, "plans_query", 0, 1).await?;
/// store.commit(tx).await?;
///
/// assert_eq!(store.get("plans_query").await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<Mutex<BTreeMap<String, Checkpoint>>>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Registered projection names.
    #[must_use]
    pub fn projection_names(&self) -> Vec<String> {
        self.checkpoints.lock().unwrap().keys().cloned().collect()
    }

    fn current(&self, name: &str) -> Result<u64> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.last_applied_sequence)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, tx: InMemoryTransaction) -> Result<()> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProjectionError::Transient(
                "injected commit failure".to_string(),
            ));
        }

        let mut checkpoints = self.checkpoints.lock().unwrap();

        let mut pending = checkpoints.clone();
        for op in &tx.ops {
            match op {
                CheckpointOp::Advance { name, from, to } => {
                    let checkpoint = pending
                        .get_mut(name)
                        .ok_or_else(|| ProjectionError::UnknownProjection(name.clone()))?;
                    if checkpoint.last_applied_sequence != *from {
                        return Err(ProjectionError::Conflict {
                            projection: name.clone(),
                            expected: *from,
                            actual: checkpoint.last_applied_sequence,
                        });
                    }
                    checkpoint.last_applied_sequence = *to;
                    checkpoint.updated_at = Utc::now();
                }
                CheckpointOp::Reset { name } => {
                    let checkpoint = pending
                        .entry(name.clone())
                        .or_insert_with(|| Checkpoint::beginning(name.clone()));
                    checkpoint.last_applied_sequence = 0;
                    checkpoint.updated_at = Utc::now();
                }
            }
        }

        *checkpoints = pending;
        // Table writes become visible while the checkpoint lock is still held.
        for write in tx.staged {
            write();
        }
        Ok(())
    }

    async fn register(&self, projection_name: &str) -> Result<u64> {
        let mut checkpoints = self.checkpoints.lock().unwrap();
        Ok(checkpoints
            .entry(projection_name.to_string())
            .or_insert_with(|| Checkpoint::beginning(projection_name))
            .last_applied_sequence)
    }

    async fn get(&self, projection_name: &str) -> Result<u64> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(projection_name)
            .map_or(0, |c| c.last_applied_sequence))
    }

    async fn advance(
        &self,
        tx: &mut InMemoryTransaction,
        projection_name: &str,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let actual = self.current(projection_name)?;
        if actual != from {
            return Err(ProjectionError::Conflict {
                projection: projection_name.to_string(),
                expected: from,
                actual,
            });
        }
        tx.ops.push(CheckpointOp::Advance {
            name: projection_name.to_string(),
            from,
            to,
        });
        Ok(())
    }

    async fn reset(&self, tx: &mut InMemoryTransaction, projection_name: &str) -> Result<()> {
        tx.ops.push(CheckpointOp::Reset {
            name: projection_name.to_string(),
        });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.lock().unwrap().values().cloned().collect())
    }
}
