//! Orchestration facade - the single entry point shared by CLI and HTTP
//!
//! Operations accept fully-parsed option structs plus an injected [`Deps`]
//! bundle and return plain data. Errors are domain errors; each adapter maps
//! them onto its own surface (HTTP status codes, CLI exit codes). No
//! module-level state: everything a call needs arrives in `Deps`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use newsstore::{
    Observation, PlannerStageEvent, QueueEvent, StoreError, TaskFilter, TaskRow, TaskStatus, TaskStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::domain::CrawlOptions;
use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorStatus};
use crate::tasks::{PlaceHubGuessOptions, PlaceHubGuessReport, guess_place_hubs as run_place_hub_guess};

/// Domain errors raised by facade operations
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("a crawl for {url} is already active")]
    CrawlAlreadyRunning { url: String },

    #[error("invalid crawl options: {0}")]
    InvalidCrawlOptions(String),

    #[error("domain not ready: {0}")]
    DomainNotReady(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("{0}")]
    Precondition(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for FacadeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => FacadeError::TaskNotFound(id),
            StoreError::Unavailable(msg) => FacadeError::StoreUnavailable(msg),
            StoreError::InvalidTransition { .. } | StoreError::Duplicate(_) => {
                FacadeError::Precondition(e.to_string())
            }
            other => FacadeError::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for FacadeError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::UnknownTaskType(t) => FacadeError::UnknownTaskType(t),
            OrchestratorError::NotFound(id) => FacadeError::TaskNotFound(id),
            OrchestratorError::Terminal { .. } | OrchestratorError::Active(_) => {
                FacadeError::Precondition(e.to_string())
            }
            OrchestratorError::InvalidConfig(msg) => FacadeError::Precondition(msg),
            OrchestratorError::Store(e) => e.into(),
            other => FacadeError::Internal(other.to_string()),
        }
    }
}

/// Injected dependency bundle
///
/// Built once at boot and cloned into each adapter; nothing module-level
/// survives between tests.
#[derive(Clone)]
pub struct Deps {
    pub store: TaskStore,
    pub orchestrator: Orchestrator,
    pub bus: Arc<EventBus>,
    pub db_path: PathBuf,
    pub readiness_min_fetches: u64,
    pub probe_timeout: Duration,
}

impl Deps {
    pub fn new(orchestrator: Orchestrator, config: &Config) -> Self {
        Self {
            store: orchestrator.store().clone(),
            bus: orchestrator.bus().clone(),
            orchestrator,
            db_path: config.storage.db_path.clone(),
            readiness_min_fetches: config.readiness.min_fetches,
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Result of starting a crawl
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStarted {
    pub job_id: String,
    pub started_at: i64,
    /// The worker argument vector the job will run with
    pub args: Vec<String>,
    pub stage: String,
}

/// Options for listing tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskListOptions {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

/// Start a crawl job
///
/// Rejects invalid options and duplicate crawls of the same seed URL.
pub async fn start_crawl(options: CrawlOptions, deps: &Deps) -> Result<CrawlStarted, FacadeError> {
    options.validate().map_err(FacadeError::InvalidCrawlOptions)?;

    let crawls = deps
        .store
        .list_tasks(TaskFilter {
            task_type: Some("crawl".to_string()),
            newest_first: true,
            ..Default::default()
        })
        .await?;
    if let Some(existing) = crawls.iter().find(|row| {
        !row.is_terminal() && row.config.get("url").and_then(|v| v.as_str()) == Some(options.url.as_str())
    }) {
        tracing::debug!(job_id = %existing.id, url = %options.url, "duplicate crawl rejected");
        return Err(FacadeError::CrawlAlreadyRunning {
            url: options.url.clone(),
        });
    }

    let config = serde_json::to_value(&options).map_err(|e| FacadeError::Internal(e.to_string()))?;
    let row = deps.orchestrator.create_task("crawl", config).await?;
    let args = options.to_worker_args(&row.id, &deps.db_path.display().to_string());

    Ok(CrawlStarted {
        job_id: row.id,
        started_at: row.created_at,
        args,
        stage: row.status.to_string(),
    })
}

/// Batch place-hub guessing; `apply: false` is a pure dry run
pub async fn guess_place_hubs(
    options: PlaceHubGuessOptions,
    deps: &Deps,
) -> Result<PlaceHubGuessReport, FacadeError> {
    if options.domains.is_empty() {
        return Err(FacadeError::Precondition("at least one domain is required".to_string()));
    }

    let report = run_place_hub_guess(&deps.store, &options, deps.readiness_min_fetches, deps.probe_timeout)
        .await
        .map_err(|e| FacadeError::Internal(e.to_string()))?;

    if options.apply && report.domain_summaries.iter().all(|s| s.readiness.status != "ready") {
        return Err(FacadeError::DomainNotReady(options.domains.join(", ")));
    }
    Ok(report)
}

/// Create a background task of a registered type
pub async fn start_background_task(task_type: &str, config: Value, deps: &Deps) -> Result<TaskRow, FacadeError> {
    Ok(deps.orchestrator.create_task(task_type, config).await?)
}

pub async fn get_task(id: &str, deps: &Deps) -> Result<TaskRow, FacadeError> {
    deps.store
        .get_task(id)
        .await?
        .ok_or_else(|| FacadeError::TaskNotFound(id.to_string()))
}

pub async fn list_tasks(options: TaskListOptions, deps: &Deps) -> Result<Vec<TaskRow>, FacadeError> {
    let status = match options.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|_| FacadeError::Precondition(format!("unknown status filter: {raw}")))?,
        ),
        None => None,
    };
    Ok(deps
        .store
        .list_tasks(TaskFilter {
            status,
            task_type: options.task_type,
            limit: options.limit,
            newest_first: true,
        })
        .await?)
}

pub async fn pause_task(id: &str, deps: &Deps) -> Result<TaskRow, FacadeError> {
    Ok(deps.orchestrator.pause_task(id).await?)
}

pub async fn resume_task(id: &str, deps: &Deps) -> Result<TaskRow, FacadeError> {
    Ok(deps.orchestrator.resume_task(id).await?)
}

pub async fn cancel_task(id: &str, deps: &Deps) -> Result<TaskRow, FacadeError> {
    Ok(deps.orchestrator.cancel_task(id).await?)
}

pub async fn delete_task(id: &str, deps: &Deps) -> Result<(), FacadeError> {
    Ok(deps.orchestrator.delete_task(id).await?)
}

pub async fn task_problems(id: &str, limit: usize, deps: &Deps) -> Result<Vec<Observation>, FacadeError> {
    get_task(id, deps).await?;
    Ok(deps.store.list_problems(id, limit).await?)
}

pub async fn task_milestones(id: &str, limit: usize, deps: &Deps) -> Result<Vec<Observation>, FacadeError> {
    get_task(id, deps).await?;
    Ok(deps.store.list_milestones(id, limit).await?)
}

pub async fn task_queue_events(id: &str, limit: usize, deps: &Deps) -> Result<Vec<QueueEvent>, FacadeError> {
    get_task(id, deps).await?;
    Ok(deps.store.list_queue_events(id, limit).await?)
}

pub async fn task_planner_stages(id: &str, limit: usize, deps: &Deps) -> Result<Vec<PlannerStageEvent>, FacadeError> {
    get_task(id, deps).await?;
    Ok(deps.store.list_planner_stages(id, limit).await?)
}

pub async fn daemon_status(deps: &Deps) -> Result<OrchestratorStatus, FacadeError> {
    Ok(deps.orchestrator.status().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use serde_json::json;
    use std::time::Duration;

    fn test_deps() -> Deps {
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let orchestrator = Orchestrator::new(
            store,
            bus,
            OrchestratorConfig {
                // Keep crawls pending so tests never spawn a worker
                max_crawl_jobs: 0,
                max_background_tasks: 0,
                ..Default::default()
            },
        );
        Deps::new(orchestrator, &Config::default())
    }

    #[tokio::test]
    async fn test_start_crawl_validates_options() {
        let deps = test_deps();
        let err = start_crawl(CrawlOptions::new("not-a-url"), &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::InvalidCrawlOptions(_)));
    }

    #[tokio::test]
    async fn test_start_crawl_returns_job() {
        let deps = test_deps();
        let mut options = CrawlOptions::new("https://example.com/");
        options.max_pages = Some(3);

        let started = start_crawl(options, &deps).await.unwrap();
        assert!(started.args.contains(&"--job-id".to_string()));
        assert!(started.args.contains(&started.job_id));
        assert_eq!(started.stage, "pending");

        let row = get_task(&started.job_id, &deps).await.unwrap();
        assert_eq!(row.task_type, "crawl");
    }

    #[tokio::test]
    async fn test_duplicate_crawl_rejected() {
        let deps = test_deps();
        let options = CrawlOptions::new("https://example.com/");
        start_crawl(options.clone(), &deps).await.unwrap();

        let err = start_crawl(options, &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::CrawlAlreadyRunning { .. }));

        // A different seed URL is fine
        start_crawl(CrawlOptions::new("https://other.example/"), &deps).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_allowed_after_terminal() {
        let deps = test_deps();
        let options = CrawlOptions::new("https://example.com/");
        let started = start_crawl(options.clone(), &deps).await.unwrap();
        cancel_task(&started.job_id, &deps).await.unwrap();

        start_crawl(options, &deps).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_background_type() {
        let deps = test_deps();
        let err = start_background_task("nope", json!({}), &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::UnknownTaskType(_)));
    }

    #[tokio::test]
    async fn test_get_task_not_found() {
        let deps = test_deps();
        let err = get_task("missing", &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_tasks_with_bad_status() {
        let deps = test_deps();
        let err = list_tasks(
            TaskListOptions {
                status: Some("sleeping".to_string()),
                ..Default::default()
            },
            &deps,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FacadeError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_guess_place_hubs_requires_domains() {
        let deps = test_deps();
        let err = guess_place_hubs(PlaceHubGuessOptions::default(), &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_guess_place_hubs_dry_run() {
        let deps = test_deps();

        // Preseed signals: a crawl row with dequeue telemetry for two domains
        let job = deps.store.create_task("crawl", json!({})).await.unwrap();
        for domain in ["a.example", "b.example"] {
            deps.store
                .append_queue_event(newsstore::QueueEvent {
                    id: 0,
                    task_id: job.id.clone(),
                    ts: newsstore::now_ms(),
                    action: newsstore::QueueAction::Dequeue,
                    url: format!("https://{domain}/"),
                    depth: Some(0),
                    host: Some(domain.to_string()),
                    reason: None,
                    queue_size: None,
                    role: None,
                    depth_bucket: None,
                })
                .await
                .unwrap();
        }

        let report = guess_place_hubs(
            PlaceHubGuessOptions {
                domains: vec!["a.example".into(), "b.example".into()],
                kinds: vec!["country".into()],
                limit: 5,
                apply: false,
            },
            &deps,
        )
        .await
        .unwrap();

        assert_eq!(report.batch.processed_domains, 2);
        assert_eq!(report.domain_summaries.len(), 2);
        assert!(report.domain_summaries.iter().all(|s| s.readiness.status == "ready"));
        assert!(report.diff_preview.inserted.is_empty());
        // Dry run left no durable trace
        assert!(deps.store.list_place_hubs("a.example", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guess_place_hubs_apply_on_cold_domains() {
        let deps = test_deps();
        let err = guess_place_hubs(
            PlaceHubGuessOptions {
                domains: vec!["cold.example".into()],
                apply: true,
                ..Default::default()
            },
            &deps,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FacadeError::DomainNotReady(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_delete() {
        let deps = test_deps();
        let started = start_crawl(CrawlOptions::new("https://example.com/"), &deps).await.unwrap();

        cancel_task(&started.job_id, &deps).await.unwrap();
        delete_task(&started.job_id, &deps).await.unwrap();

        let err = get_task(&started.job_id, &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let deps = test_deps();
        start_crawl(CrawlOptions::new("https://example.com/"), &deps).await.unwrap();

        let status = daemon_status(&deps).await.unwrap();
        assert_eq!(status.counts.total, 1);
        assert_eq!(status.counts.pending, 1);
    }

    #[tokio::test]
    async fn test_telemetry_reads_require_task() {
        let deps = test_deps();
        let err = task_problems("missing", 10, &deps).await.unwrap_err();
        assert!(matches!(err, FacadeError::TaskNotFound(_)));

        let started = start_crawl(CrawlOptions::new("https://example.com/"), &deps).await.unwrap();
        assert!(task_problems(&started.job_id, 10, &deps).await.unwrap().is_empty());
        assert!(task_queue_events(&started.job_id, 10, &deps).await.unwrap().is_empty());
    }

    #[test]
    fn test_duration_field_wired() {
        let deps_config = Config::default();
        assert_eq!(deps_config.probe_timeout(), Duration::from_secs(10));
    }
}
