// src/exec/command.rs

//! Shell command executor.

use std::process::Stdio;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dag::{ScheduledTask, TaskError};
use crate::exec::backend::{ExecFuture, TaskExecutor, TaskOutcome};

/// Runs a task's command through the platform shell.
///
/// The command is taken from `metadata.cmd`, falling back to the task
/// description. Exit code 0 is success with the captured stdout as result;
/// anything else is a transient (retryable) failure. Dependency results and
/// a resume answer are exposed as `RUNWEAVE_INPUTS` / `RUNWEAVE_ANSWER`.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    working_dir: Option<std::path::PathBuf>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

/// The shell command a task runs, if any.
pub fn command_of(task: &ScheduledTask) -> Option<String> {
    match task.metadata.get("cmd") {
        Some(Value::String(cmd)) if !cmd.trim().is_empty() => Some(cmd.clone()),
        _ if !task.description.trim().is_empty() => Some(task.description.clone()),
        _ => None,
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: ScheduledTask) -> ExecFuture<'_> {
        Box::pin(async move {
            let Some(cmd_line) = command_of(&task) else {
                return TaskOutcome::Failure(TaskError::logic(format!(
                    "task '{}' has no command",
                    task.key
                )));
            };
            match run_command(self, &task, &cmd_line).await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failure(TaskError::transient(format!(
                    "running task '{}': {e:#}",
                    task.key
                ))),
            }
        })
    }
}

async fn run_command(
    exec: &CommandExecutor,
    task: &ScheduledTask,
    cmd_line: &str,
) -> anyhow::Result<TaskOutcome> {
    info!(task = %task.task_id, key = %task.key, attempt = task.attempt, cmd = %cmd_line, "starting task process");

    // Build a shell command appropriate for the platform.
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };

    if let Some(dir) = &exec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.env("RUNWEAVE_TASK_KEY", &task.key)
        .env("RUNWEAVE_ATTEMPT", task.attempt.to_string())
        .env("RUNWEAVE_INPUTS", serde_json::to_string(&task.inputs)?);
    if let Some(answer) = &task.answer {
        cmd.env("RUNWEAVE_ANSWER", serde_json::to_string(answer)?);
    }

    // The child dies with the worker when an attempt is aborted.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    // Always consume stderr so buffers don't fill; keep the tail for errors.
    let stderr_task = child.stderr.take().map(|stderr| {
        let key = task.key.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %key, "stderr: {}", line);
                if tail.len() == 20 {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        })
    });

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut stdout).await?;
    }

    let status = child.wait().await?;
    let stderr = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    let code = status.code().unwrap_or(-1);

    info!(
        task = %task.task_id,
        key = %task.key,
        exit_code = code,
        success = status.success(),
        "task process exited"
    );

    if status.success() {
        Ok(TaskOutcome::Success(json!({
            "stdout": stdout.trim_end(),
            "exit_code": code,
        })))
    } else {
        warn!(task = %task.key, exit_code = code, "task command failed");
        Ok(TaskOutcome::Failure(
            TaskError::transient(format!("command exited with status {code}"))
                .with_detail(json!({ "exit_code": code, "stderr": stderr })),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dag::TaskErrorKind;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn scheduled(cmd: &str) -> ScheduledTask {
        ScheduledTask {
            task_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            key: "t".into(),
            title: "t".into(),
            description: String::new(),
            metadata: json!({ "cmd": cmd }),
            attempt: 0,
            inputs: BTreeMap::new(),
            answer: None,
        }
    }

    #[tokio::test]
    async fn success_captures_stdout() {
        let outcome = CommandExecutor::new().execute(scheduled("echo hello")).await;
        assert_eq!(outcome, TaskOutcome::Success(json!({"stdout": "hello", "exit_code": 0})));
    }

    #[tokio::test]
    async fn non_zero_exit_is_transient() {
        let outcome = CommandExecutor::new()
            .execute(scheduled("echo oops >&2; exit 3"))
            .await;
        match outcome {
            TaskOutcome::Failure(err) => {
                assert_eq!(err.kind, TaskErrorKind::Transient);
                assert_eq!(err.detail.unwrap()["stderr"], json!("oops"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inputs_are_exported() {
        let mut task = scheduled("printf '%s' \"$RUNWEAVE_INPUTS\"");
        task.inputs.insert("dep".into(), json!(42));
        let outcome = CommandExecutor::new().execute(task).await;
        assert_eq!(
            outcome,
            TaskOutcome::Success(json!({"stdout": "{\"dep\":42}", "exit_code": 0}))
        );
    }

    #[tokio::test]
    async fn missing_command_is_logic_error() {
        let mut task = scheduled("");
        task.metadata = Value::Null;
        match CommandExecutor::new().execute(task).await {
            TaskOutcome::Failure(err) => assert_eq!(err.kind, TaskErrorKind::Logic),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
