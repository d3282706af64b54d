// src/lib.rs

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod logging;
pub mod runs;
pub mod types;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::cli::{CliArgs, Command};
use crate::config::{ConfigFile, load_or_default, load_plan_file};
use crate::dag::graph::validate_specs;
use crate::events::{EventLog, ReadFilter};
use crate::exec::CommandExecutor;
use crate::runs::{RunStatus, TriggerSource, spawn_run_sweeper};

/// High-level entry point used by `main.rs`.
///
/// Loads `--config` (defaults if missing) and dispatches the subcommand.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_or_default(&config_path)?;

    match args.command {
        Command::Serve { bind, port } => serve(cfg, bind, port).await,
        Command::Plan {
            file,
            session,
            dry_run,
        } => run_plan_file(cfg, &file, &session, dry_run).await,
        Command::Events {
            session,
            since_seq,
            run,
        } => print_events(&cfg, &session, since_seq, run.as_deref()),
    }
}

/// `runweave serve`: control API plus the stuck-run sweeper until Ctrl-C.
async fn serve(cfg: ConfigFile, bind: Option<String>, port: Option<u16>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let port = port.unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    let sweep_interval = cfg.scheduler.sweep_interval();

    let app = App::open(cfg, Arc::new(CommandExecutor::new()))?;

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());
    let sweeper = spawn_run_sweeper(app.runs.clone(), sweep_interval, shutdown.clone());

    api::serve(app, addr, shutdown).await?;
    sweeper.await.ok();
    info!("server stopped");
    Ok(())
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("Ctrl+C received; shutting down");
        token.cancel();
    });
}

/// `runweave plan`: run a plan file's commands as one run and stream its events.
async fn run_plan_file(cfg: ConfigFile, file: &Path, session: &str, dry_run: bool) -> Result<()> {
    let plan = load_plan_file(file)
        .with_context(|| format!("failed to load plan file {}", file.display()))?;
    let specs = plan.task_specs();

    if dry_run {
        let order = validate_specs(&specs)?;
        println!("runweave dry-run: {}", plan.goal);
        println!("execution order ({} tasks):", order.len());
        for idx in order {
            let spec = &specs[idx];
            println!("  - {}", spec.key);
            println!("      cmd: {}", spec.description);
            if !spec.depends_on.is_empty() {
                println!("      depends_on: {:?}", spec.depends_on);
            }
        }
        debug!("dry-run complete (no execution)");
        return Ok(());
    }

    let executor = CommandExecutor::in_dir(plan_root_dir(file));
    let app = App::open(cfg, Arc::new(executor))?;

    let run = app.runs.create_run(
        session,
        json!({ "goal": plan.goal, "tasks": specs }),
        TriggerSource::UserMessage,
        None,
    )?;
    let mut events = app
        .events
        .subscribe_from(session, ReadFilter::since(0).for_run(run.id));
    app.runs.start(run.id)?;

    let interrupt = CancellationToken::new();
    spawn_ctrl_c(interrupt.clone());

    let idle = app.runs.wait_idle(run.id);
    tokio::pin!(idle);
    let mut cancelled = false;
    let finished = loop {
        tokio::select! {
            result = &mut idle => break result?,
            Some(event) = events.recv() => println!("{}", serde_json::to_string(&event)?),
            _ = interrupt.cancelled(), if !cancelled => {
                cancelled = true;
                app.runs.cancel(run.id)?;
            }
        }
    };
    while let Some(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }

    match finished.status {
        RunStatus::Completed => Ok(()),
        RunStatus::WaitingInput => bail!(
            "run {} is waiting for input: {}",
            finished.id,
            finished.waiting_reason.unwrap_or_default()
        ),
        RunStatus::Cancelled => bail!("run {} was cancelled", finished.id),
        status => Err(anyhow!(
            "run {} {status}: {}",
            finished.id,
            finished.latest_error.unwrap_or_default()
        )),
    }
}

/// Commands run relative to the plan file's directory.
fn plan_root_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// `runweave events`: print a session's journaled events as JSON lines.
fn print_events(cfg: &ConfigFile, session: &str, since_seq: u64, run: Option<&str>) -> Result<()> {
    let dir = cfg
        .events
        .journal_dir
        .as_ref()
        .ok_or_else(|| anyhow!("[events].journal_dir is not configured; nothing to replay"))?;
    let log = EventLog::open(dir, cfg.events.subscriber_buffer)?;

    let mut filter = ReadFilter::since(since_seq);
    if let Some(run) = run {
        filter = filter.for_run(run.parse().with_context(|| format!("invalid run id {run}"))?);
    }

    for event in log.read(session, &filter) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
