//! Crawl job runner - external worker supervision
//!
//! - [`output`] - typed parser for the worker's structured stdout
//! - [`planning`] - per-job frontier + planner pair
//! - [`watchdog`] - silence / stall / slow-start timers
//! - [`crawl`] - process spawn, event loop, signals, finalization

pub mod crawl;
pub mod output;
pub mod planning;
pub mod watchdog;

pub use crawl::{CrawlControl, CrawlJobRunner, CrawlRunnerConfig};
pub use output::{OutputParseError, WorkerEvent, parse_line};
pub use planning::JobPlanning;
pub use watchdog::{WatchdogAlert, WatchdogConfig, WatchdogState};
