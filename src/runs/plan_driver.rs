// src/runs/plan_driver.rs

//! Run driver that executes a plan through the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::SchedulerSection;
use crate::dag::{PlanOutcome, PlanScheduler, PlanStatus, SchedulerOptions, TaskGraphStore, TaskSpec};
use crate::engine::{PlanRegistry, PlanRuntime, RuntimeOptions};
use crate::errors::{Result, RunweaveError};
use crate::events::EventKind;
use crate::exec::TaskExecutor;
use crate::runs::driver::{DriveFuture, DriveMode, RunContext, RunDriver, RunOutcome};
use crate::types::{PlanId, TaskId};

/// Input accepted by [`PlanDriver`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanInput {
    /// Continue a plan that already exists in the store.
    Existing { plan_id: PlanId },
    /// Materialize a new plan on the first drive.
    New {
        goal: String,
        #[serde(default)]
        tasks: Vec<TaskSpec>,
    },
}

/// Saved in the run's `resume_payload` while it waits for input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCheckpoint {
    pub plan_id: PlanId,
    pub task_id: TaskId,
}

pub struct PlanDriver {
    store: Arc<TaskGraphStore>,
    registry: Arc<PlanRegistry>,
    executor: Arc<dyn TaskExecutor>,
    scheduler: SchedulerOptions,
    runtime: RuntimeOptions,
    default_max_retries: u32,
}

impl PlanDriver {
    pub fn new(
        store: Arc<TaskGraphStore>,
        registry: Arc<PlanRegistry>,
        executor: Arc<dyn TaskExecutor>,
        cfg: &SchedulerSection,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            scheduler: SchedulerOptions::from(cfg),
            runtime: RuntimeOptions::from(cfg),
            default_max_retries: cfg.max_retries,
        }
    }

    /// Override the options derived from `[scheduler]`.
    pub fn with_options(mut self, scheduler: SchedulerOptions, runtime: RuntimeOptions) -> Self {
        self.scheduler = scheduler;
        self.runtime = runtime;
        self
    }

    /// Which plan this drive works on, creating it if needed.
    fn resolve_plan(&self, ctx: &RunContext, mode: &DriveMode) -> Result<(PlanId, Option<(TaskId, Value)>)> {
        if let DriveMode::Resume { state, answer } = mode {
            let checkpoint: PlanCheckpoint = serde_json::from_value(state.clone())?;
            return Ok((checkpoint.plan_id, Some((checkpoint.task_id, answer.clone()))));
        }

        match serde_json::from_value::<PlanInput>(ctx.input.clone())? {
            PlanInput::Existing { plan_id } => {
                let plan = self.store.get_plan(&plan_id)?;
                if plan.session_id != ctx.session_id {
                    return Err(RunweaveError::PlanNotFound(format!(
                        "{plan_id} (not in session {})",
                        ctx.session_id
                    )));
                }
                Ok((plan_id, None))
            }
            PlanInput::New { goal, tasks } => {
                let plan =
                    self.store
                        .create_plan(&ctx.session_id, &goal, tasks, self.default_max_retries)?;
                ctx.emitter.emit(EventKind::PlanCreated {
                    plan_id: plan.id,
                    goal: plan.goal.clone(),
                    task_count: plan.task_ids.len(),
                })?;
                Ok((plan.id, None))
            }
        }
    }

    async fn drive_plan(&self, ctx: RunContext, mode: DriveMode) -> Result<RunOutcome> {
        let (plan_id, answer) = self.resolve_plan(&ctx, &mode)?;

        let mut scheduler = PlanScheduler::new(self.store.clone(), plan_id, self.scheduler);
        if let Some((task_id, answer)) = answer {
            scheduler.provide_answer(task_id, answer);
        }

        let outcome = PlanRuntime::new(
            scheduler,
            self.runtime,
            self.executor.clone(),
            ctx.emitter.clone(),
            ctx.cancel.clone(),
        )
        .with_registry(self.registry.clone())
        .run()
        .await?;

        let summary = self.store.plan_summary(&plan_id)?;
        ctx.record(|m| {
            m.tasks_total = summary.total;
            m.tasks_done = summary.done;
            m.tasks_failed = summary.failed;
            m.tasks_blocked = summary.blocked;
            m.tasks_skipped = summary.skipped;
        });

        let outcome = match outcome {
            PlanOutcome::Finished(PlanStatus::Done) => RunOutcome::Completed(json!({
                "plan_id": plan_id,
                "status": PlanStatus::Done,
                "summary": summary,
                "results": self.results(&plan_id)?,
            })),
            PlanOutcome::Finished(PlanStatus::Aborted) => {
                RunOutcome::Failed(format!("plan {plan_id} aborted"))
            }
            PlanOutcome::Finished(status) => RunOutcome::Failed(format!(
                "plan {plan_id} {status}: {} failed, {} blocked",
                summary.failed, summary.blocked
            )),
            PlanOutcome::Cancelled => RunOutcome::Cancelled,
            PlanOutcome::WaitingInput { task_id, prompt } => RunOutcome::WaitingInput {
                reason: prompt,
                state: serde_json::to_value(PlanCheckpoint { plan_id, task_id })?,
            },
        };
        Ok(outcome)
    }

    /// Results of the plan's `done` tasks by key.
    fn results(&self, plan_id: &PlanId) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .store
            .tasks_of(plan_id)?
            .into_iter()
            .filter_map(|task| task.result.map(|result| (task.key, result)))
            .collect())
    }
}

impl RunDriver for PlanDriver {
    fn drive(&self, ctx: RunContext, mode: DriveMode) -> DriveFuture<'_> {
        Box::pin(async move {
            let run_id = ctx.run_id;
            match self.drive_plan(ctx, mode).await {
                Ok(outcome) => {
                    info!(run_id = %run_id, "plan drive finished");
                    outcome
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "plan drive failed");
                    RunOutcome::Failed(e.to_string())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_shapes() {
        let new: PlanInput = serde_json::from_value(json!({
            "goal": "site",
            "tasks": [{ "key": "a" }, { "key": "b", "depends_on": ["a"] }]
        }))
        .unwrap();
        assert!(matches!(new, PlanInput::New { ref tasks, .. } if tasks.len() == 2));

        let id = uuid::Uuid::new_v4();
        let existing: PlanInput = serde_json::from_value(json!({ "plan_id": id })).unwrap();
        assert!(matches!(existing, PlanInput::Existing { plan_id } if plan_id == id));

        assert!(serde_json::from_value::<PlanInput>(json!({ "nope": 1 })).is_err());
    }
}
