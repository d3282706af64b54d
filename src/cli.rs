// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `runweave`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "runweave",
    version,
    about = "Plan/task execution engine with resumable runs and a replayable event log.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// A missing file is not an error; built-in defaults are used instead.
    #[arg(long, value_name = "PATH", default_value = "Runweave.toml", global = true)]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNWEAVE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the run control API over HTTP.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,

        /// Override `[server].port`.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a plan file and execute its task commands.
    Plan {
        /// Plan file (TOML) with a `goal` and `[[task]]` entries.
        file: PathBuf,

        /// Session the plan's events are recorded under.
        #[arg(long, default_value = "local")]
        session: String,

        /// Parse + validate, print the execution order, but run nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the journaled events of a session.
    Events {
        #[arg(long)]
        session: String,

        /// Only print events with `seq` greater than this.
        #[arg(long, default_value_t = 0)]
        since_seq: u64,

        /// Only print events tagged with this run id.
        #[arg(long)]
        run: Option<String>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
