//! Orchestrator core - scheduler loop, active handles, recovery
//!
//! The orchestrator owns the in-memory view of active tasks: a map from id
//! to a handle carrying the cancel signal, the pause gate (or the crawl
//! control channel) and the join handle. Durable state always goes through
//! the store; the map only tracks what is running right now.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use newsstore::{Observation, StatusChange, TaskCounts, TaskFilter, TaskRow, TaskStatus, TaskStore};
use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{CancelHandle, CancelSignal, PauseHandle, cancel_pair, pause_pair};
use crate::domain::{CrawlOptions, Priority};
use crate::events::EventBus;
use crate::frontier::FrontierConfig;
use crate::planner::{PlaceSeed, PlannerConfig, SeedContext};
use crate::progress::ProgressSink;
use crate::runner::{CrawlControl, CrawlJobRunner, CrawlRunnerConfig, JobPlanning};

use super::OrchestratorError;
use super::registry::{BackgroundTask, RegistrationOptions, TaskContext, TaskFactory, TaskRegistry};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrently running crawl jobs
    pub max_crawl_jobs: usize,
    /// Concurrently running background tasks
    pub max_background_tasks: usize,
    /// Pending-task poll interval
    pub poll_interval: Duration,
    /// A resuming task with no progress for this long is flagged stuck
    pub resume_stuck_after: Duration,
    /// Grace period for cooperative cancellation of in-process tasks
    pub cancel_grace: Duration,
    pub runner: CrawlRunnerConfig,
    pub planner: PlannerConfig,
    pub frontier: FrontierConfig,
    /// Topic section slugs used for seed hub guesses
    pub seed_topics: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_crawl_jobs: 2,
            max_background_tasks: 4,
            poll_interval: Duration::from_secs(1),
            resume_stuck_after: Duration::from_secs(4),
            cancel_grace: Duration::from_secs(5),
            runner: CrawlRunnerConfig::default(),
            planner: PlannerConfig::default(),
            frontier: FrontierConfig::default(),
            seed_topics: vec!["world".to_string(), "politics".to_string()],
        }
    }
}

/// Aggregate view for status displays
#[derive(Debug, serde::Serialize)]
pub struct OrchestratorStatus {
    pub counts: TaskCounts,
    pub active: Vec<String>,
    pub subscribers: usize,
}

struct ActiveTask {
    is_crawl: bool,
    supports_pause: bool,
    cancel: CancelHandle,
    pause: Option<PauseHandle>,
    control: Option<mpsc::Sender<CrawlControl>>,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

struct Inner {
    store: TaskStore,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    registry: StdMutex<TaskRegistry>,
    started: AtomicBool,
    active: Mutex<HashMap<String, ActiveTask>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    async fn deactivate(self: &Arc<Self>, task_id: &str) {
        let active: Vec<String> = {
            let mut map = self.active.lock().await;
            map.remove(task_id);
            map.keys().cloned().collect()
        };
        self.bus.job_list_changed(active);
    }
}

/// Central lifecycle manager; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: TaskStore, bus: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                config,
                registry: StdMutex::new(TaskRegistry::new()),
                started: AtomicBool::new(false),
                active: Mutex::new(HashMap::new()),
                shutdown_tx,
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Install a task type factory; rejected once started
    pub fn register_task_type(
        &self,
        task_type: &str,
        factory: TaskFactory,
        options: RegistrationOptions,
    ) -> Result<(), OrchestratorError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(OrchestratorError::RegistryFrozen);
        }
        let mut registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.register(task_type, factory, options)
    }

    /// Freeze registrations, recover interrupted tasks, start the scheduler
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("orchestrator starting");
        self.recover_interrupted_tasks().await?;

        let orch = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orch.inner.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = orch.poll_pending().await {
                            warn!(error = %e, "pending poll failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("scheduler loop stopped");
        });
        Ok(())
    }

    /// Create a task row; the scheduler starts it when a slot is free
    pub async fn create_task(&self, task_type: &str, config: serde_json::Value) -> Result<TaskRow, OrchestratorError> {
        {
            let registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            if !registry.contains(task_type) {
                return Err(OrchestratorError::UnknownTaskType(task_type.to_string()));
            }
        }
        let row = self.inner.store.create_task(task_type, config).await?;
        self.inner.bus.task_created(&row);
        debug!(task_id = %row.id, %task_type, "task created");

        // Opportunistic start once the scheduler is live; a row created
        // before start (or by another process) waits for the poll loop
        if self.inner.started.load(Ordering::SeqCst) {
            let _ = self.try_spawn(row.clone(), false).await;
        }
        self.refreshed(row).await
    }

    /// Explicitly start a pending (or resumable paused) task
    pub async fn start_task(&self, id: &str) -> Result<TaskRow, OrchestratorError> {
        let row = self.get_required(id).await?;
        if row.is_terminal() {
            return Err(OrchestratorError::Terminal {
                id: id.to_string(),
                status: row.status,
            });
        }
        if !self.is_active(id).await {
            self.try_spawn(row.clone(), false).await?;
        }
        self.refreshed(row).await
    }

    /// Pause a running task; a no-op for types without pause support
    pub async fn pause_task(&self, id: &str) -> Result<TaskRow, OrchestratorError> {
        let row = self.get_required(id).await?;
        if row.is_terminal() {
            return Ok(row);
        }

        enum PauseAction {
            None,
            Crawl(mpsc::Sender<CrawlControl>),
            Background,
        }

        let action = {
            let map = self.inner.active.lock().await;
            match map.get(id) {
                Some(active) if active.is_crawl => match &active.control {
                    Some(control) => PauseAction::Crawl(control.clone()),
                    None => PauseAction::None,
                },
                Some(active) if active.supports_pause => {
                    if let Some(pause) = &active.pause {
                        pause.pause();
                    }
                    PauseAction::Background
                }
                Some(_) => {
                    debug!(task_id = %id, "pause is a no-op for this task type");
                    PauseAction::None
                }
                None => PauseAction::None,
            }
        };

        match action {
            PauseAction::Crawl(control) => {
                let _ = control.send(CrawlControl::Pause).await;
            }
            PauseAction::Background => {
                let updated = self
                    .inner
                    .store
                    .update_status(id, TaskStatus::Paused, StatusChange::default())
                    .await?;
                self.inner.bus.task_status_changed(id, updated.status, None);
                return Ok(updated);
            }
            PauseAction::None => {}
        }
        self.refreshed(row).await
    }

    /// Resume a paused task
    pub async fn resume_task(&self, id: &str) -> Result<TaskRow, OrchestratorError> {
        let row = self.get_required(id).await?;
        if row.is_terminal() {
            return Ok(row);
        }

        enum ResumeAction {
            None,
            Crawl(mpsc::Sender<CrawlControl>),
            Background,
            Respawn,
        }

        let action = {
            let map = self.inner.active.lock().await;
            match map.get(id) {
                Some(active) if active.is_crawl => match &active.control {
                    Some(control) => ResumeAction::Crawl(control.clone()),
                    None => ResumeAction::None,
                },
                Some(active) => {
                    if let Some(pause) = &active.pause {
                        pause.resume();
                    }
                    if active.supports_pause && row.status == TaskStatus::Paused {
                        ResumeAction::Background
                    } else {
                        ResumeAction::None
                    }
                }
                None if row.status == TaskStatus::Paused => ResumeAction::Respawn,
                None => ResumeAction::None,
            }
        };

        match action {
            ResumeAction::Crawl(control) => {
                let _ = control.send(CrawlControl::Resume).await;
            }
            ResumeAction::Background => {
                let updated = self
                    .inner
                    .store
                    .update_status(id, TaskStatus::Running, StatusChange::default())
                    .await?;
                self.inner.bus.task_status_changed(id, updated.status, None);
                return Ok(updated);
            }
            ResumeAction::Respawn => {
                // Paused with no live runner (e.g. paused before a restart)
                self.try_spawn(row.clone(), false).await?;
            }
            ResumeAction::None => {}
        }
        self.refreshed(row).await
    }

    /// Cancel a task; idempotent, honored by every type
    pub async fn cancel_task(&self, id: &str) -> Result<TaskRow, OrchestratorError> {
        let row = self.get_required(id).await?;
        if row.is_terminal() {
            debug!(task_id = %id, status = %row.status, "cancel of terminal task is a no-op");
            return Ok(row);
        }

        let was_active = {
            let map = self.inner.active.lock().await;
            match map.get(id) {
                Some(active) => {
                    active.cancel.cancel();
                    if let Some(pause) = &active.pause {
                        // Unblock a paused task so it can observe the cancel
                        pause.resume();
                    }
                    true
                }
                None => false,
            }
        };

        if !was_active {
            // Never started (or survived a restart as paused); finalize here
            let updated = self
                .inner
                .store
                .update_status(id, TaskStatus::Cancelled, StatusChange::default())
                .await?;
            self.inner.bus.task_status_changed(id, updated.status, None);
            self.inner.bus.task_completed(id, updated.status, json!({}));
            return Ok(updated);
        }
        self.refreshed(row).await
    }

    /// Delete a task row and its telemetry; the row must not be active
    pub async fn delete_task(&self, id: &str) -> Result<(), OrchestratorError> {
        if self.is_active(id).await {
            return Err(OrchestratorError::Active(id.to_string()));
        }
        self.inner.store.delete_task(id).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        let counts = self.inner.store.task_counts().await?;
        let active = {
            let map = self.inner.active.lock().await;
            let mut ids: Vec<String> = map.keys().cloned().collect();
            ids.sort();
            ids
        };
        Ok(OrchestratorStatus {
            counts,
            active,
            subscribers: self.inner.bus.subscriber_count(),
        })
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.active.lock().await.contains_key(id)
    }

    /// Stop the scheduler and cancel all active tasks
    pub async fn shutdown(&self, timeout: Duration) {
        info!("orchestrator shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        {
            let map = self.inner.active.lock().await;
            map.values().for_each(|t| t.cancel.cancel());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.inner.active.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let map = self.inner.active.lock().await;
        if !map.is_empty() {
            warn!(remaining = map.len(), "aborting tasks that missed the shutdown deadline");
            for (id, task) in map.iter() {
                debug!(task_id = %id, "aborting task");
                task.join.abort();
            }
        }
        info!("orchestrator shutdown complete");
    }

    /// Boot recovery: every interrupted task moves to resuming and gets its
    /// runner re-established, with a stuck watchdog
    pub async fn recover_interrupted_tasks(&self) -> Result<(), OrchestratorError> {
        let interrupted = self.inner.store.find_interrupted_tasks().await?;
        if interrupted.is_empty() {
            debug!("no interrupted tasks to recover");
            return Ok(());
        }
        info!(count = interrupted.len(), "recovering interrupted tasks");

        for row in interrupted {
            let row = self
                .inner
                .store
                .update_status(&row.id, TaskStatus::Resuming, StatusChange::default())
                .await?;
            self.inner.bus.task_status_changed(&row.id, row.status, None);

            // Stuck watchdog: no progress within the budget means the
            // resume never re-established a live runner
            let store = self.inner.store.clone();
            let bus = self.inner.bus.clone();
            let task_id = row.id.clone();
            let budget = self.inner.config.resume_stuck_after;
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                match store.get_task(&task_id).await {
                    Ok(Some(row)) if row.status == TaskStatus::Resuming => {
                        warn!(%task_id, "task stuck in resuming");
                        let obs = Observation::new(
                            &task_id,
                            "stuck-resuming",
                            format!("no progress within {}s of resume", budget.as_secs()),
                        )
                        .with_scope("job", &task_id);
                        if let Err(e) = store.append_problem(obs.clone()).await {
                            warn!(%task_id, error = %e, "stuck-resuming problem append dropped");
                        }
                        bus.task_problem(obs);
                    }
                    _ => {}
                }
            });

            if let Err(e) = self.try_spawn(row.clone(), true).await {
                warn!(task_id = %row.id, error = %e, "recovery spawn failed");
                let change = StatusChange {
                    error_message: Some(format!("recovery failed: {e}")),
                };
                if let Ok(updated) = self.inner.store.update_status(&row.id, TaskStatus::Failed, change).await {
                    self.inner.bus.task_status_changed(&row.id, updated.status, updated.error_message.clone());
                    self.inner.bus.task_completed(&row.id, updated.status, json!({}));
                }
            }
        }
        Ok(())
    }

    /// One scheduler pass: start pending tasks while slots are free
    ///
    /// Resuming rows without a live runner (slot contention at boot) are
    /// retried first so recovery work is not starved by new requests.
    async fn poll_pending(&self) -> Result<(), OrchestratorError> {
        let resuming = self
            .inner
            .store
            .list_tasks(TaskFilter {
                status: Some(TaskStatus::Resuming),
                newest_first: false,
                ..Default::default()
            })
            .await?;
        for row in resuming {
            if !self.is_active(&row.id).await {
                let id = row.id.clone();
                if let Err(e) = self.try_spawn(row, true).await {
                    warn!(task_id = %id, error = %e, "resume retry failed");
                }
            }
        }

        let mut pending = self
            .inner
            .store
            .list_tasks(TaskFilter {
                status: Some(TaskStatus::Pending),
                newest_first: false,
                ..Default::default()
            })
            .await?;

        // Highest priority first; creation order within a level
        pending.sort_by_key(|row| std::cmp::Reverse(Priority::from_config(&row.config)));

        for row in pending {
            let id = row.id.clone();
            match self.try_spawn(row, false).await {
                Ok(_) => {}
                // A task that can never start should not sit pending forever
                Err(e @ (OrchestratorError::UnknownTaskType(_) | OrchestratorError::InvalidConfig(_))) => {
                    warn!(task_id = %id, error = %e, "failing unstartable task");
                    let change = StatusChange {
                        error_message: Some(e.to_string()),
                    };
                    if let Ok(updated) = self.inner.store.update_status(&id, TaskStatus::Failed, change).await {
                        self.inner
                            .bus
                            .task_status_changed(&id, updated.status, updated.error_message.clone());
                        self.inner.bus.task_completed(&id, updated.status, json!({}));
                    }
                }
                Err(e) => warn!(task_id = %id, error = %e, "spawn attempt failed"),
            }
        }
        Ok(())
    }

    /// Seed context for a new crawl: configured topics plus gazetteer places
    async fn seed_context(&self) -> SeedContext {
        let places = match self.inner.store.list_places(None, 16).await {
            Ok(places) => places
                .into_iter()
                .filter_map(|place| {
                    Some(PlaceSeed {
                        kind: place.kind.parse().ok()?,
                        name: place.name,
                        country: place.country,
                    })
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not load gazetteer places for seeding");
                Vec::new()
            }
        };
        SeedContext {
            topics: self.inner.config.seed_topics.clone(),
            places,
        }
    }

    async fn get_required(&self, id: &str) -> Result<TaskRow, OrchestratorError> {
        self.inner
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    async fn refreshed(&self, fallback: TaskRow) -> Result<TaskRow, OrchestratorError> {
        Ok(self.inner.store.get_task(&fallback.id).await?.unwrap_or(fallback))
    }

    /// Try to start a task now; false when no slot is free or it is already
    /// active
    async fn try_spawn(&self, row: TaskRow, recovered: bool) -> Result<bool, OrchestratorError> {
        let (is_crawl, registration) = {
            let registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            if !registry.contains(&row.task_type) {
                return Err(OrchestratorError::UnknownTaskType(row.task_type.clone()));
            }
            (registry.is_crawl(&row.task_type), registry.get(&row.task_type).cloned())
        };

        let mut active = self.inner.active.lock().await;
        if active.contains_key(&row.id) {
            return Ok(false);
        }
        let cap = if is_crawl {
            self.inner.config.max_crawl_jobs
        } else {
            self.inner.config.max_background_tasks
        };
        let in_use = active.values().filter(|t| t.is_crawl == is_crawl).count();
        if in_use >= cap {
            debug!(task_id = %row.id, is_crawl, in_use, cap, "no slot free");
            return Ok(false);
        }

        if !recovered {
            let updated = self
                .inner
                .store
                .update_status(&row.id, TaskStatus::Running, StatusChange::default())
                .await?;
            self.inner.bus.task_status_changed(&row.id, updated.status, None);
        }

        let sink = ProgressSink::new(self.inner.store.clone(), self.inner.bus.clone(), &row.id);
        if recovered {
            sink.mark_resuming();
        }
        let (cancel_handle, cancel_signal) = cancel_pair();

        let handle = if is_crawl {
            let options: CrawlOptions = serde_json::from_value(row.config.clone())
                .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
            let (control_tx, control_rx) = mpsc::channel(8);
            let planning = JobPlanning::new(
                &row.id,
                &options,
                self.inner.config.planner.clone(),
                self.inner.config.frontier.clone(),
                self.seed_context().await,
            );
            let runner = CrawlJobRunner::new(
                self.inner.store.clone(),
                self.inner.bus.clone(),
                sink,
                self.inner.config.runner.clone(),
                &row.id,
                options,
                control_rx,
                cancel_signal,
            )
            .with_planning(planning);
            let inner = self.inner.clone();
            let task_id = row.id.clone();
            let join = tokio::spawn(async move {
                runner.run().await;
                inner.deactivate(&task_id).await;
            });
            ActiveTask {
                is_crawl: true,
                supports_pause: true,
                cancel: cancel_handle,
                pause: None,
                control: Some(control_tx),
                join,
            }
        } else {
            let Some(registration) = registration else {
                return Err(OrchestratorError::UnknownTaskType(row.task_type.clone()));
            };
            let task = (registration.factory)(&row.config)
                .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
            let (pause_handle, pause_gate) = pause_pair();
            let ctx = TaskContext {
                store: self.inner.store.clone(),
                task_id: row.id.clone(),
                config: row.config.clone(),
                cancel: cancel_signal.clone(),
                pause: pause_gate,
                progress: sink,
            };
            let inner = self.inner.clone();
            let task_id = row.id.clone();
            let grace = self.inner.config.cancel_grace;
            let join = tokio::spawn(async move {
                run_background_task(inner.clone(), &task_id, task, ctx, cancel_signal, grace).await;
                inner.deactivate(&task_id).await;
            });
            ActiveTask {
                is_crawl: false,
                supports_pause: registration.options.supports_pause,
                cancel: cancel_handle,
                pause: Some(pause_handle),
                control: None,
                join,
            }
        };

        active.insert(row.id.clone(), handle);
        let ids: Vec<String> = active.keys().cloned().collect();
        drop(active);

        info!(task_id = %row.id, task_type = %row.task_type, recovered, "task started");
        self.inner.bus.job_list_changed(ids);
        Ok(true)
    }
}

/// Drive one in-process task to a terminal status
async fn run_background_task(
    inner: Arc<Inner>,
    task_id: &str,
    mut task: Box<dyn BackgroundTask>,
    ctx: TaskContext,
    mut cancel: CancelSignal,
    grace: Duration,
) {
    let fut = task.run(ctx);
    tokio::pin!(fut);

    let mut cancelled = false;
    let outcome = tokio::select! {
        result = &mut fut => result,
        _ = cancel.cancelled() => {
            cancelled = true;
            debug!(%task_id, "cancel observed, granting grace period");
            match tokio::time::timeout(grace, &mut fut).await {
                Ok(result) => result,
                Err(_) => Err(eyre::eyre!("task did not stop within the grace period")),
            }
        }
    };

    let (status, error_message) = if cancelled {
        (TaskStatus::Cancelled, None)
    } else {
        match outcome {
            Ok(()) => (TaskStatus::Completed, None),
            Err(e) => (TaskStatus::Failed, Some(e.to_string())),
        }
    };

    let summary = match inner.store.get_task(task_id).await {
        Ok(Some(row)) => json!({
            "pages": row.progress_current,
            "total": row.progress_total,
            "stage": row.metadata.get("stage"),
            "message": row.progress_message,
        }),
        _ => json!({}),
    };

    let change = StatusChange {
        error_message: error_message.clone(),
    };
    match inner.store.update_status(task_id, status, change).await {
        Ok(row) => {
            inner.bus.task_status_changed(task_id, row.status, error_message);
            inner.bus.task_completed(task_id, row.status, summary);
        }
        Err(e) => {
            warn!(%task_id, %status, error = %e, "final status write failed");
            if let Ok(Some(row)) = inner.store.get_task(task_id).await {
                inner.bus.task_completed(task_id, row.status, summary);
            }
        }
    }
    info!(%task_id, %status, "background task finished");
}
