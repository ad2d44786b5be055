//! newscrawld configuration types and loading
//!
//! One YAML document declares everything tunable: storage paths, the HTTP
//! bind address, concurrency caps, watchdog timeouts, planner feature flags,
//! frontier fairness knobs and the worker command. All of it is read once at
//! boot; there is no hot reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::EventBus;
use crate::frontier::FrontierConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::planner::PlannerConfig;
use crate::runner::{CrawlRunnerConfig, WatchdogConfig};

/// Main newscrawld configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage locations
    pub storage: StorageConfig,

    /// HTTP adapter
    pub http: HttpConfig,

    /// Concurrency caps
    pub concurrency: ConcurrencyConfig,

    /// Watchdog timeouts
    pub watchdogs: WatchdogTimeouts,

    /// Planner feature flags and bounds
    pub planner: PlannerConfig,

    /// Frontier fairness knobs
    pub frontier: FrontierSettings,

    /// External crawl worker invocation
    pub worker: WorkerConfig,

    /// Event bus sizing
    pub events: EventsConfig,

    /// Place-hub readiness probing
    pub readiness: ReadinessConfig,

    /// Seed planning inputs
    pub seeds: SeedsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".newscrawld.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("newscrawld").join("newscrawld.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            silence: Duration::from_secs(self.watchdogs.silence_timeout_secs),
            stall: Duration::from_secs(self.watchdogs.stall_timeout_secs),
            first_output: Duration::from_secs(self.watchdogs.first_output_secs),
        }
    }

    pub fn runner_config(&self) -> CrawlRunnerConfig {
        CrawlRunnerConfig {
            worker_program: self.worker.program.clone(),
            worker_base_args: self.worker.args.clone(),
            db_path: self.storage.db_path.clone(),
            watchdog: self.watchdog_config(),
            cancel_grace: Duration::from_secs(self.watchdogs.cancel_grace_secs),
            tick: Duration::from_secs(1),
        }
    }

    pub fn frontier_config(&self) -> FrontierConfig {
        FrontierConfig {
            host_window_ms: self.frontier.host_window_secs as i64 * 1000,
            host_penalty_milli: self.frontier.host_penalty_milli,
            cost_aware: self.planner.flags.cost_aware_priority,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_crawl_jobs: self.concurrency.max_crawl_jobs,
            max_background_tasks: self.concurrency.max_background_tasks,
            poll_interval: Duration::from_secs(1),
            resume_stuck_after: Duration::from_secs(self.watchdogs.resume_stuck_secs),
            cancel_grace: Duration::from_secs(self.watchdogs.cancel_grace_secs),
            runner: self.runner_config(),
            planner: self.planner.clone(),
            frontier: self.frontier_config(),
            seed_topics: self.seeds.topics.clone(),
        }
    }

    pub fn event_bus(&self) -> EventBus {
        EventBus::new(
            self.events.channel_capacity,
            self.events.retention,
            Duration::from_secs(self.events.heartbeat_secs),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.probe_timeout_secs)
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,

    /// Directory holding fetched pages
    #[serde(rename = "pages-dir")]
    pub pages_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("newscrawld.db"),
            pages_dir: PathBuf::from("pages"),
        }
    }
}

/// HTTP adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Concurrency caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "max-crawl-jobs")]
    pub max_crawl_jobs: usize,

    #[serde(rename = "max-background-tasks")]
    pub max_background_tasks: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_crawl_jobs: 2,
            max_background_tasks: 4,
        }
    }
}

/// Watchdog timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogTimeouts {
    #[serde(rename = "silence-timeout-secs")]
    pub silence_timeout_secs: u64,

    #[serde(rename = "stall-timeout-secs")]
    pub stall_timeout_secs: u64,

    #[serde(rename = "first-output-secs")]
    pub first_output_secs: u64,

    #[serde(rename = "cancel-grace-secs")]
    pub cancel_grace_secs: u64,

    #[serde(rename = "resume-stuck-secs")]
    pub resume_stuck_secs: u64,
}

impl Default for WatchdogTimeouts {
    fn default() -> Self {
        Self {
            silence_timeout_secs: 120,
            stall_timeout_secs: 300,
            first_output_secs: 10,
            cancel_grace_secs: 5,
            resume_stuck_secs: 4,
        }
    }
}

/// Frontier fairness knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontierSettings {
    /// Sliding window for per-host fetch counting
    #[serde(rename = "host-window-secs")]
    pub host_window_secs: u64,

    /// Priority milli-units depressed per recent same-host fetch
    #[serde(rename = "host-penalty-milli")]
    pub host_penalty_milli: i64,
}

impl Default for FrontierSettings {
    fn default() -> Self {
        Self {
            host_window_secs: 60,
            host_penalty_milli: 1_000,
        }
    }
}

/// External crawl worker invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable
    pub program: String,

    /// Arguments placed before the job-specific ones
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "crawl-worker".to_string(),
            args: Vec::new(),
        }
    }
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    #[serde(rename = "channel-capacity")]
    pub channel_capacity: usize,

    pub retention: usize,

    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            retention: 1024,
            heartbeat_secs: 30,
        }
    }
}

/// Place-hub readiness probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Dequeues a domain needs before guessing is worthwhile
    #[serde(rename = "min-fetches")]
    pub min_fetches: u64,

    #[serde(rename = "probe-timeout-secs")]
    pub probe_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            min_fetches: 1,
            probe_timeout_secs: 10,
        }
    }
}

/// Seed planning inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedsConfig {
    /// Topic section slugs tried as hub guesses
    pub topics: Vec<String>,
}

impl Default for SeedsConfig {
    fn default() -> Self {
        Self {
            topics: vec!["world".to_string(), "politics".to_string()],
        }
    }
}
