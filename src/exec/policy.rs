// src/exec/policy.rs

//! Tool policy hooks around task execution.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::dag::{ScheduledTask, TaskError};
use crate::exec::backend::{ExecFuture, TaskExecutor, TaskOutcome};
use crate::types::TaskId;

/// What a policy hook sees about a tool call.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub tool: &'a str,
    pub arguments: &'a Value,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Block { reason: String },
}

/// Pre/post hooks consulted around every tool call.
pub trait ToolPolicy: Send + Sync {
    /// Veto a call before it runs.
    fn pre_hook(&self, ctx: &PolicyContext<'_>) -> PolicyDecision;

    /// Optional annotation attached to the call's result.
    fn post_hook(&self, _ctx: &PolicyContext<'_>, _outcome: &TaskOutcome) -> Option<Value> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ToolPolicy for AllowAll {
    fn pre_hook(&self, _ctx: &PolicyContext<'_>) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Blocks a fixed set of tool names.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    denied: HashSet<String>,
}

impl DenyList {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: tools.into_iter().map(Into::into).collect(),
        }
    }
}

impl ToolPolicy for DenyList {
    fn pre_hook(&self, ctx: &PolicyContext<'_>) -> PolicyDecision {
        if self.denied.contains(ctx.tool) {
            PolicyDecision::Block {
                reason: format!("tool '{}' is denied by policy", ctx.tool),
            }
        } else {
            PolicyDecision::Allow
        }
    }
}

/// Tool name of a task: `metadata.tool`, or the task key.
pub fn tool_of(task: &ScheduledTask) -> &str {
    task.metadata
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or(&task.key)
}

/// Wraps an executor so every task passes the policy first.
///
/// A blocked task fails with a `policy` error (never retried); the
/// scheduler turns that into a `tool_policy_blocked` event.
pub struct PolicyGuardedExecutor<E> {
    inner: E,
    policy: Arc<dyn ToolPolicy>,
}

impl<E: TaskExecutor> PolicyGuardedExecutor<E> {
    pub fn new(inner: E, policy: Arc<dyn ToolPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl<E: TaskExecutor> TaskExecutor for PolicyGuardedExecutor<E> {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_> {
        Box::pin(async move {
            let tool = tool_of(&task).to_string();
            let arguments = task.metadata.clone();
            let ctx = PolicyContext {
                tool: &tool,
                arguments: &arguments,
                task_id: Some(task.task_id),
            };

            if let PolicyDecision::Block { reason } = self.policy.pre_hook(&ctx) {
                warn!(task = %task.task_id, tool = %tool, %reason, "tool call blocked by policy");
                return TaskOutcome::Failure(
                    TaskError::policy(reason).with_detail(json!({ "tool": tool })),
                );
            }

            let outcome = self.inner.execute(task).await;
            match self.policy.post_hook(&ctx, &outcome) {
                Some(note) => {
                    debug!(tool = %tool, "policy annotated tool result");
                    annotate(outcome, note)
                }
                None => outcome,
            }
        })
    }
}

fn annotate(outcome: TaskOutcome, note: Value) -> TaskOutcome {
    match outcome {
        TaskOutcome::Success(Value::Object(mut map)) => {
            map.insert("policy_annotation".into(), note);
            TaskOutcome::Success(Value::Object(map))
        }
        TaskOutcome::Success(other) => TaskOutcome::Success(json!({
            "value": other,
            "policy_annotation": note,
        })),
        TaskOutcome::Failure(mut err) => {
            err.detail = Some(json!({ "detail": err.detail.take(), "policy_annotation": note }));
            TaskOutcome::Failure(err)
        }
        waiting @ TaskOutcome::NeedsInput(_) => waiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskErrorKind;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counting(AtomicUsize);

    impl TaskExecutor for Counting {
        fn execute(&self, _task: ScheduledTask) -> ExecFuture<'_> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { TaskOutcome::Success(json!("ran")) })
        }
    }

    struct Audit;

    impl ToolPolicy for Audit {
        fn pre_hook(&self, _ctx: &PolicyContext<'_>) -> PolicyDecision {
            PolicyDecision::Allow
        }

        fn post_hook(&self, ctx: &PolicyContext<'_>, _outcome: &TaskOutcome) -> Option<Value> {
            Some(json!({ "audited": ctx.tool }))
        }
    }

    fn task(tool: &str) -> ScheduledTask {
        ScheduledTask {
            task_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            key: "k".into(),
            title: "k".into(),
            description: String::new(),
            metadata: json!({ "tool": tool }),
            attempt: 0,
            inputs: BTreeMap::new(),
            answer: None,
        }
    }

    #[tokio::test]
    async fn blocked_tool_never_runs() {
        let inner = Arc::new(Counting(AtomicUsize::new(0)));
        let exec = PolicyGuardedExecutor::new(inner.clone(), Arc::new(DenyList::new(["rm"])));

        match exec.execute(task("rm")).await {
            TaskOutcome::Failure(err) => {
                assert_eq!(err.kind, TaskErrorKind::Policy);
                assert_eq!(err.detail, Some(json!({ "tool": "rm" })));
            }
            other => panic!("expected policy failure, got {other:?}"),
        }
        assert_eq!(inner.0.load(Ordering::SeqCst), 0);

        assert!(exec.execute(task("ls")).await.is_success());
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_hook_annotates_result() {
        let exec = PolicyGuardedExecutor::new(Counting(AtomicUsize::new(0)), Arc::new(Audit));
        let outcome = exec.execute(task("fetch")).await;
        assert_eq!(
            outcome,
            TaskOutcome::Success(json!({ "value": "ran", "policy_annotation": { "audited": "fetch" } }))
        );
    }
}
