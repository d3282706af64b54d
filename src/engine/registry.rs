// src/engine/registry.rs

//! Lookup of running plan executions, for delivering decisions.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::dag::{PlanScheduler, TaskGraphStore};
use crate::engine::PlanDecision;
use crate::engine::runtime::Inbox;
use crate::errors::Result;
use crate::events::{EventEmitter, EventLog};
use crate::types::PlanId;

/// Sender side of a running [`super::PlanRuntime`].
#[derive(Debug, Clone)]
pub struct PlanControl {
    tx: mpsc::Sender<Inbox>,
}

impl PlanControl {
    pub(crate) fn new(tx: mpsc::Sender<Inbox>) -> Self {
        Self { tx }
    }

    /// Apply `decision` inside the running execution.
    ///
    /// Returns `None` if the runtime has already stopped.
    pub async fn decide(&self, decision: PlanDecision) -> Option<Result<()>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Inbox::Decide { decision, reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Running plan executions by plan id.
#[derive(Debug, Default)]
pub struct PlanRegistry {
    active: Mutex<HashMap<PlanId, PlanControl>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<PlanId, PlanControl>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a running execution; it is removed when the guard drops.
    ///
    /// Returns `None` if another execution of the plan is already attached.
    pub fn try_register(self: Arc<Self>, plan_id: PlanId, control: PlanControl) -> Option<Registration> {
        match self.active().entry(plan_id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(control);
            }
        }
        Some(Registration {
            registry: self,
            plan_id,
        })
    }

    pub fn get(&self, plan_id: &PlanId) -> Option<PlanControl> {
        self.active().get(plan_id).cloned()
    }

    pub fn is_running(&self, plan_id: &PlanId) -> bool {
        self.active().contains_key(plan_id)
    }
}

#[derive(Debug)]
pub struct Registration {
    registry: Arc<PlanRegistry>,
    plan_id: PlanId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.active().remove(&self.plan_id);
    }
}

/// Apply a decision to a plan whether or not an execution is running.
///
/// With a running execution the decision goes through its event loop (so
/// dispatch follows immediately). Otherwise only task state changes; the
/// next execution of the plan picks it up.
pub async fn apply_decision(
    registry: &PlanRegistry,
    store: &Arc<TaskGraphStore>,
    events: &Arc<EventLog>,
    plan_id: PlanId,
    decision: PlanDecision,
) -> Result<()> {
    if let Some(control) = registry.get(&plan_id) {
        if let Some(result) = control.decide(decision).await {
            return result;
        }
    }

    let plan = store.get_plan(&plan_id)?;
    debug!(plan = %plan_id, ?decision, "applying decision to idle plan");

    let mut scheduler = PlanScheduler::detached(store.clone(), plan_id);
    let step = match decision {
        PlanDecision::Skip(task_id) => scheduler.skip(task_id)?,
        PlanDecision::Retry(task_id) => scheduler.retry(task_id)?,
        PlanDecision::Abort => scheduler.abort()?,
    };

    EventEmitter::new(events.clone(), plan.session_id, None).emit_all(step.events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> PlanControl {
        let (tx, _rx) = mpsc::channel(1);
        PlanControl::new(tx)
    }

    #[test]
    fn one_execution_per_plan() {
        let registry = Arc::new(PlanRegistry::new());
        let plan_id = uuid::Uuid::new_v4();

        let first = registry.clone().try_register(plan_id, control());
        assert!(first.is_some());
        assert!(registry.clone().try_register(plan_id, control()).is_none());
        assert!(registry.is_running(&plan_id));

        drop(first);
        assert!(!registry.is_running(&plan_id));
        assert!(registry.clone().try_register(plan_id, control()).is_some());
    }
}
