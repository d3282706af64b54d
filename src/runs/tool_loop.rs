// src/runs/tool_loop.rs

//! Run driver for a bounded model ⇄ tool loop.
//!
//! Each iteration asks the [`TurnModel`] for its next move. A tool call is
//! checked against the [`ToolPolicy`], executed by the [`ToolInvoker`] and
//! appended to the transcript; a final answer completes the run. A tool that
//! needs user input suspends the run, and the answer becomes that tool's
//! result on resume.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::RunsSection;
use crate::errors::Result;
use crate::events::EventKind;
use crate::exec::{AllowAll, PolicyContext, PolicyDecision, TaskOutcome, ToolPolicy};
use crate::runs::driver::{DriveFuture, DriveMode, RunContext, RunDriver, RunOutcome};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One completed tool call, as shown to the model on the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExchange {
    pub tool: String,
    pub arguments: Value,
    pub output: Value,
}

/// The model's move for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    ToolCall { tool: String, arguments: Value },
    Final(Value),
}

/// Token usage reported with a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Language model collaborator.
pub trait TurnModel: Send + Sync {
    fn next_turn<'a>(
        &'a self,
        input: &'a Value,
        transcript: &'a [ToolExchange],
    ) -> BoxFuture<'a, anyhow::Result<(ModelTurn, TurnUsage)>>;
}

/// Executes tool calls on behalf of the model.
pub trait ToolInvoker: Send + Sync {
    fn invoke<'a>(&'a self, tool: &'a str, arguments: &'a Value) -> BoxFuture<'a, TaskOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PendingCall {
    tool: String,
    arguments: Value,
}

/// Loop state carried across a suspension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LoopState {
    transcript: Vec<ToolExchange>,
    iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<PendingCall>,
}

pub struct ToolLoopDriver {
    model: Arc<dyn TurnModel>,
    tools: Arc<dyn ToolInvoker>,
    policy: Arc<dyn ToolPolicy>,
    max_iterations: u32,
}

impl ToolLoopDriver {
    pub fn new(model: Arc<dyn TurnModel>, tools: Arc<dyn ToolInvoker>, max_iterations: u32) -> Self {
        Self {
            model,
            tools,
            policy: Arc::new(AllowAll),
            max_iterations,
        }
    }

    /// Iteration limit from `[runs].max_tool_iterations`.
    pub fn from_config(
        model: Arc<dyn TurnModel>,
        tools: Arc<dyn ToolInvoker>,
        cfg: &RunsSection,
    ) -> Self {
        Self::new(model, tools, cfg.max_tool_iterations)
    }

    pub fn with_policy(mut self, policy: Arc<dyn ToolPolicy>) -> Self {
        self.policy = policy;
        self
    }

    async fn run_loop(&self, ctx: &RunContext, mode: DriveMode) -> Result<RunOutcome> {
        let mut state = match mode {
            DriveMode::Start => LoopState::default(),
            DriveMode::Resume { state, answer } => {
                let mut state: LoopState = serde_json::from_value(state)?;
                if let Some(call) = state.pending.take() {
                    ctx.emitter.emit(EventKind::ToolResult {
                        tool: call.tool.clone(),
                        output: answer.clone(),
                    })?;
                    state.transcript.push(ToolExchange {
                        tool: call.tool,
                        arguments: call.arguments,
                        output: answer,
                    });
                }
                state
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if state.iterations >= self.max_iterations {
                return Ok(RunOutcome::Failed(format!(
                    "exceeded max tool iterations ({})",
                    self.max_iterations
                )));
            }
            state.iterations += 1;

            let turn = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                turn = self.model.next_turn(&ctx.input, &state.transcript) => turn,
            };
            let (turn, usage) = match turn {
                Ok(turn) => turn,
                Err(e) => return Ok(RunOutcome::Failed(format!("model error: {e:#}"))),
            };
            ctx.record(|m| {
                m.input_tokens += usage.input_tokens;
                m.output_tokens += usage.output_tokens;
            });

            let (tool, arguments) = match turn {
                ModelTurn::Final(output) => {
                    info!(run_id = %ctx.run_id, iterations = state.iterations, "tool loop finished");
                    return Ok(RunOutcome::Completed(output));
                }
                ModelTurn::ToolCall { tool, arguments } => (tool, arguments),
            };

            ctx.emitter.emit(EventKind::ToolCalled {
                tool: tool.clone(),
                arguments: arguments.clone(),
            })?;
            ctx.record(|m| m.tool_calls += 1);

            let policy_ctx = PolicyContext {
                tool: &tool,
                arguments: &arguments,
                task_id: None,
            };
            if let PolicyDecision::Block { reason } = self.policy.pre_hook(&policy_ctx) {
                warn!(run_id = %ctx.run_id, %tool, %reason, "tool call blocked by policy");
                ctx.emitter.emit(EventKind::ToolPolicyBlocked {
                    tool: tool.clone(),
                    reason: reason.clone(),
                    task_id: None,
                })?;
                state.transcript.push(ToolExchange {
                    tool,
                    arguments,
                    output: json!({ "error": format!("blocked by policy: {reason}") }),
                });
                continue;
            }

            // Runs to completion even if cancelled; the loop head checks the token.
            let outcome = self.tools.invoke(&tool, &arguments).await;
            let note = self.policy.post_hook(&policy_ctx, &outcome);

            let mut output = match outcome {
                TaskOutcome::Success(output) => output,
                TaskOutcome::Failure(err) => json!({ "error": err.message, "kind": err.kind }),
                TaskOutcome::NeedsInput(prompt) => {
                    debug!(run_id = %ctx.run_id, %tool, "tool needs user input");
                    state.pending = Some(PendingCall { tool, arguments });
                    return Ok(RunOutcome::WaitingInput {
                        reason: prompt,
                        state: serde_json::to_value(&state)?,
                    });
                }
            };
            if let Some(note) = note {
                output = json!({ "value": output, "policy_annotation": note });
            }

            ctx.emitter.emit(EventKind::ToolResult {
                tool: tool.clone(),
                output: output.clone(),
            })?;
            state.transcript.push(ToolExchange {
                tool,
                arguments,
                output,
            });
        }
    }
}

impl RunDriver for ToolLoopDriver {
    fn drive(&self, ctx: RunContext, mode: DriveMode) -> DriveFuture<'_> {
        Box::pin(async move {
            match self.run_loop(&ctx, mode).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id = %ctx.run_id, error = %e, "tool loop failed");
                    RunOutcome::Failed(e.to_string())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::events::{EventEmitter, EventLog, ReadFilter};
    use crate::exec::DenyList;

    /// Calls each scripted tool in order, then answers with the transcript length.
    struct Scripted {
        calls: Vec<&'static str>,
    }

    impl TurnModel for Scripted {
        fn next_turn<'a>(
            &'a self,
            _input: &'a Value,
            transcript: &'a [ToolExchange],
        ) -> BoxFuture<'a, anyhow::Result<(ModelTurn, TurnUsage)>> {
            Box::pin(async move {
                let usage = TurnUsage {
                    input_tokens: 10,
                    output_tokens: 1,
                };
                let turn = match self.calls.get(transcript.len()) {
                    Some(tool) => ModelTurn::ToolCall {
                        tool: tool.to_string(),
                        arguments: json!({ "n": transcript.len() }),
                    },
                    None => ModelTurn::Final(json!({ "turns": transcript.len() })),
                };
                Ok((turn, usage))
            })
        }
    }

    /// `ask` needs input; everything else echoes its arguments.
    #[derive(Default)]
    struct Tools {
        invoked: Mutex<Vec<String>>,
    }

    impl ToolInvoker for Tools {
        fn invoke<'a>(&'a self, tool: &'a str, arguments: &'a Value) -> BoxFuture<'a, TaskOutcome> {
            Box::pin(async move {
                self.invoked.lock().unwrap().push(tool.to_string());
                match tool {
                    "ask" => TaskOutcome::NeedsInput("name please".into()),
                    _ => TaskOutcome::Success(arguments.clone()),
                }
            })
        }
    }

    fn ctx(log: &Arc<EventLog>) -> RunContext {
        let run_id = uuid::Uuid::new_v4();
        RunContext::new(
            run_id,
            "s".into(),
            json!("go"),
            CancellationToken::new(),
            EventEmitter::new(log.clone(), "s", Some(run_id)),
        )
    }

    #[tokio::test]
    async fn completes_after_tool_calls() {
        let log = Arc::new(EventLog::in_memory(64));
        let driver = ToolLoopDriver::new(
            Arc::new(Scripted {
                calls: vec!["search", "fetch"],
            }),
            Arc::new(Tools::default()),
            8,
        );
        let ctx = ctx(&log);

        let outcome = driver.drive(ctx.clone(), DriveMode::Start).await;
        assert_eq!(outcome, RunOutcome::Completed(json!({ "turns": 2 })));

        let metrics = ctx.metrics();
        assert_eq!(metrics.tool_calls, 2);
        assert_eq!(metrics.input_tokens, 30);

        let types: Vec<_> = log
            .read("s", &ReadFilter::default())
            .iter()
            .map(|e| e.type_name())
            .collect();
        assert_eq!(types, vec!["tool_called", "tool_result", "tool_called", "tool_result"]);
    }

    #[tokio::test]
    async fn suspends_and_feeds_the_answer_back() {
        let log = Arc::new(EventLog::in_memory(64));
        let tools = Arc::new(Tools::default());
        let driver = ToolLoopDriver::new(
            Arc::new(Scripted {
                calls: vec!["ask", "search"],
            }),
            tools.clone(),
            8,
        );

        let outcome = driver.drive(ctx(&log), DriveMode::Start).await;
        let RunOutcome::WaitingInput { reason, state } = outcome else {
            panic!("expected waiting_input, got {outcome:?}");
        };
        assert_eq!(reason, "name please");

        let outcome = driver
            .drive(
                ctx(&log),
                DriveMode::Resume {
                    state,
                    answer: json!("Ada"),
                },
            )
            .await;
        assert_eq!(outcome, RunOutcome::Completed(json!({ "turns": 2 })));
        assert_eq!(*tools.invoked.lock().unwrap(), vec!["ask", "search"]);
    }

    #[tokio::test]
    async fn iteration_limit_fails_the_run() {
        let log = Arc::new(EventLog::in_memory(64));
        let driver = ToolLoopDriver::new(
            Arc::new(Scripted {
                calls: vec!["a", "b", "c"],
            }),
            Arc::new(Tools::default()),
            2,
        );
        let outcome = driver.drive(ctx(&log), DriveMode::Start).await;
        assert!(matches!(outcome, RunOutcome::Failed(msg) if msg.contains("max tool iterations")));
    }

    #[tokio::test]
    async fn blocked_tools_are_reported_to_the_model() {
        let log = Arc::new(EventLog::in_memory(64));
        let tools = Arc::new(Tools::default());
        let driver = ToolLoopDriver::new(
            Arc::new(Scripted {
                calls: vec!["rm", "search"],
            }),
            tools.clone(),
            8,
        )
        .with_policy(Arc::new(DenyList::new(["rm"])));

        let outcome = driver.drive(ctx(&log), DriveMode::Start).await;
        assert_eq!(outcome, RunOutcome::Completed(json!({ "turns": 2 })));
        assert_eq!(*tools.invoked.lock().unwrap(), vec!["search"]);

        let blocked = log
            .read("s", &ReadFilter::default())
            .into_iter()
            .find(|e| e.type_name() == "tool_policy_blocked")
            .expect("policy event");
        assert_eq!(blocked.source, crate::events::EventSource::Session);
    }
}
