//! Command-line interface definitions
//!
//! Every task type gets a subcommand whose flags mirror its config schema.
//! Output is human-formatted by default; `--json` switches every command to
//! machine output. Exit code 0 on success, 1 on any domain error.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// newscrawld - news crawl orchestration daemon
#[derive(Debug, Parser)]
#[command(name = "nd", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground: recovery, scheduler, HTTP adapter
    Serve,

    /// Crawl job operations
    Crawl {
        #[command(subcommand)]
        command: CrawlCommand,
    },

    /// Task lifecycle operations
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Place-hub guessing
    PlaceHubs {
        #[command(subcommand)]
        command: PlaceHubsCommand,
    },

    /// Tail bus events as JSON lines until interrupted
    Events,

    /// Aggregate status: task counts, active jobs, subscribers
    Status,

    /// Background daemon process control
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CrawlCommand {
    /// Start a crawl job
    Start {
        /// Seed URL
        url: String,

        /// Page budget
        #[arg(long = "max-pages")]
        max_pages: Option<u64>,

        /// Link depth budget
        #[arg(long = "max-depth")]
        max_depth: Option<u32>,

        /// Crawl type key
        #[arg(long = "crawl-type")]
        crawl_type: Option<String>,

        /// Extra argument passed to the worker verbatim (repeatable)
        #[arg(long = "worker-arg", allow_hyphen_values = true)]
        worker_args: Vec<String>,
    },

    /// List crawl jobs
    List {
        /// Filter by status (pending, running, completed, ...)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a background task
    Start {
        /// Registered task type (compress, analyze, ingest-gazetteer, guess-place-hubs)
        task_type: String,

        /// Task config as inline JSON
        #[arg(long, default_value = "{}")]
        config: String,
    },

    /// List tasks
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long = "type")]
        task_type: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one task with its telemetry counts
    Show { id: String },

    /// Pause a running task
    Pause { id: String },

    /// Resume a paused task
    Resume { id: String },

    /// Cancel a task (idempotent)
    Cancel { id: String },

    /// Delete a task row and its telemetry
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
pub enum PlaceHubsCommand {
    /// Guess place hubs for domains
    Guess {
        /// Domain to process (repeatable)
        #[arg(long, required = true)]
        domain: Vec<String>,

        /// Place kind to guess for (repeatable; defaults to country)
        #[arg(long)]
        kind: Vec<String>,

        /// Candidates per domain per kind
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Write accepted guesses instead of previewing
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start,

    /// Stop the background daemon
    Stop,

    /// Show daemon process status
    Status,
}
