//! Shared fixtures for the plans query tests.

#![allow(dead_code)] // Not every test binary uses every fixture
#![allow(clippy::unwrap_used)]

use plans_query::{Plan, PlanCreated, PlanTable, PlanTableWriter};
use projector_core::{ProjectionError, Result};
use projector_testing::InMemoryTransaction;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Plans table held in memory. Writes are staged on the transaction and only
/// land when the checkpoint store commits it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPlanTable {
    rows: Arc<Mutex<BTreeMap<String, Plan>>>,
    inserts: Arc<AtomicUsize>,
    rejected: Arc<Mutex<Option<String>>>,
    fail_create: bool,
}

impl InMemoryPlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table whose `create` always fails.
    pub fn broken() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Refuse inserts of plan `id` with a storage error until cleared.
    pub fn reject(&self, id: Option<&str>) {
        *self.rejected.lock().unwrap() = id.map(str::to_string);
    }

    /// Number of committed inserts.
    pub fn committed_inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Write a row outside any transaction.
    pub fn put_directly(&self, plan: Plan) {
        self.rows.lock().unwrap().insert(plan.id.clone(), plan);
    }

    pub fn ids(&self) -> Vec<String> {
        self.rows.lock().unwrap().keys().cloned().collect()
    }
}

impl PlanTable for InMemoryPlanTable {
    async fn create(&self) -> Result<()> {
        if self.fail_create {
            return Err(ProjectionError::Storage("relation cannot be created".to_string()));
        }
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Plan>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Plan>> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }
}

impl PlanTableWriter<InMemoryTransaction> for InMemoryPlanTable {
    async fn insert(&self, tx: &mut InMemoryTransaction, plan: &Plan) -> Result<()> {
        if self.rejected.lock().unwrap().as_deref() == Some(plan.id.as_str()) {
            return Err(ProjectionError::Storage(format!(
                "check constraint violated for {}",
                plan.id
            )));
        }

        let rows = Arc::clone(&self.rows);
        let inserts = Arc::clone(&self.inserts);
        let plan = plan.clone();
        tx.stage(move || {
            rows.lock().unwrap().insert(plan.id.clone(), plan);
            inserts.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn truncate(&self, tx: &mut InMemoryTransaction) -> Result<()> {
        let rows = Arc::clone(&self.rows);
        tx.stage(move || rows.lock().unwrap().clear());
        Ok(())
    }
}

/// A plan with every field set.
pub fn plan_created(assets: &[&str], quantum: i32, loss_protection: f64, time_frame: i32) -> PlanCreated {
    PlanCreated {
        assets: assets.iter().map(|a| (*a).to_string()).collect(),
        security: "2-of-3".to_string(),
        strategy: "equal".to_string(),
        quantum,
        loss_protection,
        time_frame,
    }
}
