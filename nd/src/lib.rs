//! newsdaemon - news crawl orchestration core
//!
//! A single-process daemon that schedules, executes, persists and reports on
//! two kinds of long-running work: crawl jobs (an external worker fetching
//! web content, supervised over a structured stdout protocol) and background
//! tasks (in-process cooperative routines over already-stored data). Both
//! share one lifecycle substrate: durable rows in SQLite, pause/resume,
//! progress streaming, and recovery after restart.
//!
//! # Modules
//!
//! - [`domain`] - crawl options, plans, priorities
//! - [`events`] - typed pub/sub bus with lag markers and retention
//! - [`frontier`] - per-crawl URL priority queue with host fairness
//! - [`planner`] - seed and continuation candidate generation
//! - [`runner`] - external worker supervision and output parsing
//! - [`orchestrator`] - lifecycle state machine, scheduler, recovery
//! - [`tasks`] - built-in background task types
//! - [`facade`] - the entry points shared by CLI and HTTP
//! - [`http`] - REST + SSE adapter
//! - [`cli`] - command-line interface
//! - [`config`] - configuration types and loading
//! - [`daemon`] - pid-file daemon management

pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod domain;
pub mod events;
pub mod facade;
pub mod frontier;
pub mod http;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod runner;
pub mod tasks;

// Re-export commonly used types
pub use config::Config;
pub use control::{CancelHandle, CancelSignal, PauseGate, PauseHandle, cancel_pair, pause_pair};
pub use domain::{CandidateRole, CrawlOptions, Plan, PlanStep, Priority};
pub use events::{BusEvent, Delivery, Envelope, EventBus, Subscription, Topic, create_event_bus};
pub use facade::{CrawlStarted, Deps, FacadeError, TaskListOptions};
pub use frontier::{Frontier, FrontierConfig, FrontierEntry, PriorityScorer};
pub use orchestrator::{
    BackgroundTask, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus, RegistrationOptions,
    TaskContext, TaskRegistry,
};
pub use planner::{
    CostDeviation, CostModel, ExpansionContext, PatternBook, PlaceKind, PlaceSeed, Planner, PlannerConfig,
    PlannerFlags, PlannerSignal, SeedContext,
};
pub use progress::ProgressSink;
pub use runner::{
    CrawlControl, CrawlJobRunner, CrawlRunnerConfig, JobPlanning, WatchdogConfig, WorkerEvent, parse_line,
};
pub use tasks::register_builtin_tasks;
