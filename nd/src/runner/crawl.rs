//! Crawl job runner - external worker supervision
//!
//! Spawns the crawl worker as a child process, translates its structured
//! stdout into store mutations and bus events, runs the watchdogs, and
//! finalizes the task when the worker exits. Pause, resume and stop are
//! delivered as OS signals; cancellation escalates from SIGTERM to SIGKILL
//! after a grace period.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use newsstore::{
    Observation, PlannerStageEvent, ProgressUpdate, QueueEvent, StatusChange, TaskStatus, TaskStore, now_ms,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::CancelSignal;
use crate::domain::CrawlOptions;
use crate::events::EventBus;
use crate::progress::ProgressSink;

use super::output::{WorkerEvent, parse_line};
use super::planning::JobPlanning;
use super::watchdog::{WatchdogAlert, WatchdogConfig, WatchdogState};

/// Lines of stderr kept for failure diagnostics
const STDERR_TAIL: usize = 20;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct CrawlRunnerConfig {
    /// Worker executable
    pub worker_program: String,
    /// Arguments placed before the job-specific ones
    pub worker_base_args: Vec<String>,
    /// Durable store path, passed to the worker via `--db`
    pub db_path: PathBuf,
    pub watchdog: WatchdogConfig,
    /// SIGTERM-to-SIGKILL escalation window
    pub cancel_grace: Duration,
    /// Watchdog evaluation interval
    pub tick: Duration,
}

impl Default for CrawlRunnerConfig {
    fn default() -> Self {
        Self {
            worker_program: "crawl-worker".to_string(),
            worker_base_args: Vec::new(),
            db_path: PathBuf::from("newscrawld.db"),
            watchdog: WatchdogConfig::default(),
            cancel_grace: Duration::from_secs(5),
            tick: Duration::from_secs(1),
        }
    }
}

/// Control requests delivered to a running crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlControl {
    Pause,
    Resume,
    Cancel,
}

/// Why the worker is being terminated early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Cancelled,
    FatalError,
    Silence,
}

/// Mutable bookkeeping shared by the event handlers
struct RunState {
    store: TaskStore,
    bus: Arc<EventBus>,
    sink: ProgressSink,
    task_id: String,
    pid: Option<u32>,
    last_progress: (u64, u64),
    last_message: Option<String>,
    last_stage: Option<String>,
    first_error: Option<String>,
    stderr_tail: VecDeque<String>,
    /// Frontier + planner for this job; None runs the worker unassisted
    planning: Option<JobPlanning>,
    /// Candidate URLs waiting to be written to the worker's stdin
    feed: Vec<String>,
}

impl RunState {
    fn metadata(&self) -> Value {
        let mut meta = json!({ "pid": self.pid });
        if let Some(ref stage) = self.last_stage {
            meta["stage"] = json!(stage);
        }
        meta
    }

    /// Apply one parsed worker event; returns a fatal error message if the
    /// worker asked to be shut down
    async fn handle_event(&mut self, event: WorkerEvent, wd: &mut WatchdogState) -> Option<String> {
        match event {
            WorkerEvent::Progress { current, total, stage, message } => {
                wd.note_progress(current, total, Instant::now().into_std());
                self.last_progress = (current, total);
                if stage.is_some() {
                    self.last_stage = stage;
                }
                if message.is_some() {
                    self.last_message = message.clone();
                }
                let update = ProgressUpdate {
                    current: Some(current),
                    total: Some(total),
                    message,
                    metadata: Some(self.metadata()),
                };
                if let Err(e) = self.sink.update(update).await {
                    warn!(task_id = %self.task_id, error = %e, "progress write failed");
                }
            }
            WorkerEvent::Queue { action, url, depth, host, reason, queue_size, role, depth_bucket } => {
                let event = QueueEvent {
                    id: 0,
                    task_id: self.task_id.clone(),
                    ts: now_ms(),
                    action,
                    url,
                    depth,
                    host,
                    reason,
                    queue_size,
                    role,
                    depth_bucket,
                };
                if let Err(e) = self.store.append_queue_event(event.clone()).await {
                    warn!(task_id = %self.task_id, error = %e, "queue event append dropped");
                }
                self.bus.queue_event(event);
            }
            WorkerEvent::Problem { kind, scope, target, message, details } => {
                if kind == "candidate-miss"
                    && let Some(url) = target.as_deref()
                    && let Some(planning) = self.planning.as_mut()
                {
                    let fed = planning.on_candidate_missed(url);
                    self.feed.extend(fed);
                }
                if let Some(planning) = self.planning.as_mut() {
                    let fed = planning.on_problem();
                    self.feed.extend(fed);
                }
                let mut obs = Observation::new(&self.task_id, kind, message);
                obs.scope = scope;
                obs.target = target;
                obs.details = details;
                self.record_problem(obs).await;
            }
            WorkerEvent::Milestone { kind, scope, target, message, details } => {
                match kind.as_str() {
                    "hub-verified" => {
                        if let Some(url) = target.clone()
                            && let Some(planning) = self.planning.as_mut()
                        {
                            let fed = planning.on_hub_verified(&url);
                            self.feed.extend(fed);
                        }
                    }
                    "fetched" => {
                        let url = details
                            .as_ref()
                            .and_then(|d| d.get("url"))
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .or_else(|| target.clone());
                        let duration = details
                            .as_ref()
                            .and_then(|d| d.get("duration_ms"))
                            .and_then(|v| v.as_u64());
                        if let (Some(url), Some(duration), Some(planning)) =
                            (url, duration, self.planning.as_mut())
                        {
                            if let Some(deviation) = planning.on_fetch_observed(&url, duration) {
                                let fed = planning.on_cost_deviation(&deviation);
                                self.feed.extend(fed);
                                let obs = Observation::new(
                                    &self.task_id,
                                    "cost-deviation",
                                    format!(
                                        "estimated {}ms, actual {}ms for {}",
                                        deviation.estimated_ms, deviation.actual_ms, deviation.url
                                    ),
                                )
                                .with_scope("url", &deviation.url);
                                self.record_problem(obs).await;
                            }
                        }
                    }
                    _ => {}
                }
                let mut obs = Observation::new(&self.task_id, kind, message);
                obs.scope = scope;
                obs.target = target;
                obs.details = details;
                if let Err(e) = self.store.append_milestone(obs.clone()).await {
                    warn!(task_id = %self.task_id, error = %e, "milestone append dropped");
                }
                self.bus.milestone(obs);
            }
            WorkerEvent::PlannerStage { stage, rationale, estimated_cost_ms, decision } => {
                let mut event = PlannerStageEvent::new(&self.task_id, stage);
                event.rationale = rationale;
                event.estimated_cost_ms = estimated_cost_ms;
                event.decision = decision;
                if let Err(e) = self.store.append_planner_stage(event.clone()).await {
                    warn!(task_id = %self.task_id, error = %e, "planner stage append dropped");
                }
                self.bus.planner_stage(event);
            }
            WorkerEvent::Error { message, fatal } => {
                if self.first_error.is_none() {
                    self.first_error = Some(message.clone());
                }
                self.bus.task_error(&self.task_id, &message, fatal);
                if fatal {
                    return Some(message);
                }
            }
            WorkerEvent::Cache { details } => {
                // Advisory diagnostic; fold into metadata and surface as progress
                let mut meta = self.metadata();
                meta["cache"] = details;
                let update = ProgressUpdate {
                    metadata: Some(meta),
                    ..Default::default()
                };
                if let Err(e) = self.sink.update(update).await {
                    debug!(task_id = %self.task_id, error = %e, "cache metadata write failed");
                }
            }
        }
        None
    }

    async fn record_problem(&self, obs: Observation) {
        if let Err(e) = self.store.append_problem(obs.clone()).await {
            warn!(task_id = %self.task_id, error = %e, "problem append dropped");
        }
        self.bus.task_problem(obs);
    }

    /// Persist planning telemetry and feed queued candidates to the worker
    async fn flush_planning(&mut self, stdin: &mut Option<ChildStdin>) {
        let Some(planning) = self.planning.as_mut() else {
            self.feed.clear();
            return;
        };
        let (queue_events, stages) = planning.drain_telemetry();
        for event in queue_events {
            if let Err(e) = self.store.append_queue_event(event.clone()).await {
                warn!(task_id = %self.task_id, error = %e, "queue event append dropped");
            }
            self.bus.queue_event(event);
        }
        for stage in stages {
            if let Err(e) = self.store.append_planner_stage(stage.clone()).await {
                warn!(task_id = %self.task_id, error = %e, "planner stage append dropped");
            }
            self.bus.planner_stage(stage);
        }

        if self.feed.is_empty() {
            return;
        }
        let urls: Vec<String> = self.feed.drain(..).collect();
        if let Some(stdin) = stdin.as_mut() {
            for url in urls {
                debug!(task_id = %self.task_id, %url, "feeding candidate to worker");
                if stdin.write_all(format!("SEED {url}\n").as_bytes()).await.is_err() {
                    debug!(task_id = %self.task_id, "worker stdin closed, dropping candidates");
                    break;
                }
            }
            let _ = stdin.flush().await;
        }
    }

    async fn job_problem(&self, kind: &str, message: String) {
        let obs = Observation::new(&self.task_id, kind, message).with_scope("job", &self.task_id);
        self.record_problem(obs).await;
    }

    fn note_stderr(&mut self, line: String) {
        if self.stderr_tail.len() == STDERR_TAIL {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }

    fn failure_detail(&self) -> Option<String> {
        self.first_error
            .clone()
            .or_else(|| self.stderr_tail.back().cloned())
    }
}

/// Supervises one crawl worker from spawn to terminal status
pub struct CrawlJobRunner {
    store: TaskStore,
    bus: Arc<EventBus>,
    sink: ProgressSink,
    config: CrawlRunnerConfig,
    task_id: String,
    options: CrawlOptions,
    control_rx: mpsc::Receiver<CrawlControl>,
    cancel: CancelSignal,
    planning: Option<JobPlanning>,
}

impl CrawlJobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TaskStore,
        bus: Arc<EventBus>,
        sink: ProgressSink,
        config: CrawlRunnerConfig,
        task_id: impl Into<String>,
        options: CrawlOptions,
        control_rx: mpsc::Receiver<CrawlControl>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            store,
            bus,
            sink,
            config,
            task_id: task_id.into(),
            options,
            control_rx,
            cancel,
            planning: None,
        }
    }

    /// Attach per-job planning (frontier + planner)
    pub fn with_planning(mut self, planning: JobPlanning) -> Self {
        self.planning = Some(planning);
        self
    }

    /// Run the worker to completion; always resolves to a terminal status
    pub async fn run(self) -> TaskStatus {
        let CrawlJobRunner {
            store,
            bus,
            sink,
            config,
            task_id,
            options,
            mut control_rx,
            mut cancel,
            mut planning,
        } = self;

        // Seed planning up front so the worker starts with the plan's picks
        let seed_urls = planning.as_mut().map(|p| p.seed(&options)).unwrap_or_default();

        let mut args = options.to_worker_args(&task_id, &config.db_path.display().to_string());
        for url in &seed_urls {
            args.push("--seed".to_string());
            args.push(url.clone());
        }
        debug!(%task_id, program = %config.worker_program, ?args, "spawning crawl worker");

        let mut command = Command::new(&config.worker_program);
        command
            .args(&config.worker_base_args)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn crawl worker {}: {e}", config.worker_program);
                warn!(%task_id, %message);
                return finalize(&store, &bus, &task_id, TaskStatus::Failed, Some(message), &json!({})).await;
            }
        };

        let pid = child.id();
        info!(%task_id, ?pid, "crawl worker started");

        let mut state = RunState {
            store: store.clone(),
            bus: bus.clone(),
            sink,
            task_id: task_id.clone(),
            pid,
            last_progress: (0, 0),
            last_message: None,
            last_stage: Some("starting".to_string()),
            first_error: None,
            stderr_tail: VecDeque::new(),
            planning,
            feed: Vec::new(),
        };

        // Record the worker pid before any terminal transition can freeze the row
        if let Err(e) = store
            .update_progress(
                &task_id,
                ProgressUpdate {
                    metadata: Some(state.metadata()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(%task_id, error = %e, "pid metadata write failed");
        }

        let mut stdin = child.stdin.take();
        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        // Persist the seed plan's queue events and planner stages
        state.flush_planning(&mut stdin).await;

        let mut wd = WatchdogState::new(config.watchdog.clone(), std::time::Instant::now());
        let mut ticker = tokio::time::interval(config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut paused = false;
        let mut kill_reason: Option<KillReason> = None;
        let mut kill_deadline: Option<Instant> = None;

        let exit_status = loop {
            tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_lines.is_some() => {
                    match line {
                        Some(line) => {
                            wd.note_output(std::time::Instant::now());
                            match parse_line(&line) {
                                Ok(event) => {
                                    let fatal = state.handle_event(event, &mut wd).await;
                                    state.flush_planning(&mut stdin).await;
                                    if let Some(fatal) = fatal
                                        && kill_reason.is_none()
                                    {
                                        warn!(%task_id, message = %fatal, "worker reported fatal error, stopping it");
                                        kill_reason = Some(KillReason::FatalError);
                                        kill_deadline = Some(Instant::now() + config.cancel_grace);
                                        terminate(&mut child, pid, paused);
                                        paused = false;
                                    }
                                }
                                Err(e) => debug!(%task_id, error = %e, line, "ignoring unparseable worker line"),
                            }
                        }
                        None => stdout_lines = None,
                    }
                }
                line = next_line(&mut stderr_lines), if stderr_lines.is_some() => {
                    match line {
                        Some(line) => {
                            wd.note_output(std::time::Instant::now());
                            debug!(%task_id, %line, "worker stderr");
                            state.note_stderr(line);
                        }
                        None => stderr_lines = None,
                    }
                }
                Some(ctrl) = control_rx.recv(), if kill_reason.is_none() => {
                    match ctrl {
                        CrawlControl::Pause if !paused => {
                            debug!(%task_id, "pausing crawl worker");
                            suspend(pid, true);
                            paused = true;
                            set_status(&store, &bus, &task_id, TaskStatus::Paused).await;
                        }
                        CrawlControl::Resume if paused => {
                            debug!(%task_id, "resuming crawl worker");
                            suspend(pid, false);
                            paused = false;
                            wd.reset(std::time::Instant::now());
                            set_status(&store, &bus, &task_id, TaskStatus::Running).await;
                        }
                        CrawlControl::Cancel => {
                            info!(%task_id, "cancelling crawl worker");
                            kill_reason = Some(KillReason::Cancelled);
                            kill_deadline = Some(Instant::now() + config.cancel_grace);
                            terminate(&mut child, pid, paused);
                            paused = false;
                        }
                        _ => {}
                    }
                }
                _ = cancel.cancelled(), if kill_reason.is_none() => {
                    info!(%task_id, "cancel signal raised, stopping crawl worker");
                    kill_reason = Some(KillReason::Cancelled);
                    kill_deadline = Some(Instant::now() + config.cancel_grace);
                    terminate(&mut child, pid, paused);
                    paused = false;
                }
                status = child.wait() => break status,
                _ = ticker.tick() => {
                    if let Some(deadline) = kill_deadline
                        && Instant::now() >= deadline
                    {
                        warn!(%task_id, "grace period expired, killing worker");
                        let _ = child.start_kill();
                        kill_deadline = None;
                    }
                    if !paused && kill_reason.is_none() {
                        for alert in wd.tick(std::time::Instant::now()) {
                            match alert {
                                WatchdogAlert::SlowStart { waited } => {
                                    state.job_problem("slow-start", format!(
                                        "no worker output within {}s of spawn", waited.as_secs()
                                    )).await;
                                }
                                WatchdogAlert::Silence { waited } => {
                                    state.job_problem("silence", format!(
                                        "no worker output for {}s", waited.as_secs()
                                    )).await;
                                }
                                WatchdogAlert::Stall { waited } => {
                                    state.job_problem("stall", format!(
                                        "progress frozen at {}/{} for {}s",
                                        state.last_progress.0, state.last_progress.1, waited.as_secs()
                                    )).await;
                                }
                                WatchdogAlert::SilenceKill { waited } => {
                                    warn!(%task_id, "silence watchdog terminating worker");
                                    state.job_problem("silence", format!(
                                        "silence exceeded twice the threshold ({}s), terminating worker",
                                        waited.as_secs()
                                    )).await;
                                    kill_reason = Some(KillReason::Silence);
                                    let _ = child.start_kill();
                                }
                            }
                        }
                    }
                }
            }
        };

        // The worker is gone; drain whatever stdout it managed to flush
        if let Some(lines) = stdout_lines.as_mut() {
            while let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await
            {
                if let Ok(event) = parse_line(&line) {
                    let _ = state.handle_event(event, &mut wd).await;
                }
            }
        }
        if let Some(lines) = stderr_lines.as_mut() {
            while let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await
            {
                state.note_stderr(line);
            }
        }

        // Persist whatever planning telemetry the tail produced, then drop
        // the frontier with the job
        state.feed.clear();
        state.flush_planning(&mut stdin).await;
        if let Some(planning) = state.planning.as_mut() {
            planning.discard();
        }

        let exit_code = exit_status.as_ref().ok().and_then(|s| s.code());
        let (final_status, error_message) = match kill_reason {
            Some(KillReason::Cancelled) => (TaskStatus::Cancelled, None),
            Some(KillReason::Silence) => (
                TaskStatus::Failed,
                Some(format!(
                    "worker terminated by silence watchdog after {}s without output",
                    config.watchdog.silence.as_secs() * 2
                )),
            ),
            Some(KillReason::FatalError) => (
                TaskStatus::Failed,
                state.failure_detail().or(Some("worker reported a fatal error".to_string())),
            ),
            None => match exit_code {
                Some(0) => (TaskStatus::Completed, None),
                Some(code) => (
                    TaskStatus::Failed,
                    Some(match state.failure_detail() {
                        Some(detail) => format!("worker exited with code {code}: {detail}"),
                        None => format!("worker exited with code {code}"),
                    }),
                ),
                None => (
                    TaskStatus::Failed,
                    Some("worker terminated by signal".to_string()),
                ),
            },
        };

        // Clear the pid while the row is still mutable
        state.pid = None;
        let _ = store
            .update_progress(
                &task_id,
                ProgressUpdate {
                    metadata: Some(state.metadata()),
                    ..Default::default()
                },
            )
            .await;

        let summary = json!({
            "pages": state.last_progress.0,
            "total": state.last_progress.1,
            "stage": state.last_stage,
            "message": state.last_message,
        });

        info!(%task_id, status = %final_status, ?exit_code, "crawl worker finished");
        finalize(&store, &bus, &task_id, final_status, error_message, &summary).await
    }
}

/// Read the next line from an optional reader; pends forever when exhausted
async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "worker pipe read error");
                None
            }
        },
        None => std::future::pending().await,
    }
}

/// SIGSTOP / SIGCONT the worker (no-op off Unix)
fn suspend(pid: Option<u32>, stop: bool) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let signal = if stop { Signal::SIGSTOP } else { Signal::SIGCONT };
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            warn!(pid, ?signal, error = %e, "worker signal failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, stop);
        warn!("pause/resume signals are not supported on this platform");
    }
}

/// Graceful stop: SIGCONT if paused, then SIGTERM; SIGKILL comes later if
/// the grace period runs out
fn terminate(child: &mut Child, pid: Option<u32>, paused: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Some(pid) = pid {
            let pid = Pid::from_raw(pid as i32);
            if paused {
                let _ = kill(pid, Signal::SIGCONT);
            }
            if kill(pid, Signal::SIGTERM).is_ok() {
                return;
            }
        }
        let _ = child.start_kill();
    }
    #[cfg(not(unix))]
    {
        let _ = paused;
        let _ = pid;
        let _ = child.start_kill();
    }
}

async fn set_status(store: &TaskStore, bus: &EventBus, task_id: &str, status: TaskStatus) {
    match store.update_status(task_id, status, StatusChange::default()).await {
        Ok(row) => bus.task_status_changed(task_id, row.status, None),
        Err(e) => warn!(%task_id, %status, error = %e, "status transition failed"),
    }
}

async fn finalize(
    store: &TaskStore,
    bus: &EventBus,
    task_id: &str,
    status: TaskStatus,
    error_message: Option<String>,
    summary: &Value,
) -> TaskStatus {
    let change = StatusChange {
        error_message: error_message.clone(),
    };
    match store.update_status(task_id, status, change).await {
        Ok(row) => {
            bus.task_status_changed(task_id, row.status, error_message);
            bus.task_completed(task_id, row.status, summary.clone());
            row.status
        }
        Err(e) => {
            // Already terminal (e.g. cancelled concurrently); report what stands
            warn!(%task_id, %status, error = %e, "final status write failed");
            let row = store.get_task(task_id).await.ok().flatten();
            let status = row.map(|r| r.status).unwrap_or(status);
            bus.task_completed(task_id, status, summary.clone());
            status
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::control::cancel_pair;
    use crate::events::{Delivery, Topic};
    use newsstore::QueueAction;
    use std::sync::Arc;

    struct Fixture {
        store: TaskStore,
        bus: Arc<EventBus>,
        task_id: String,
        control_tx: mpsc::Sender<CrawlControl>,
        runner: CrawlJobRunner,
    }

    async fn fixture(script: &str, config: CrawlRunnerConfig) -> Fixture {
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let options = CrawlOptions::new("https://example.com/");
        let row = store
            .create_task("crawl", serde_json::to_value(&options).unwrap())
            .await
            .unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();

        let (control_tx, control_rx) = mpsc::channel(8);
        let (_cancel_handle, cancel) = cancel_pair();
        // Leak the handle so dropping it does not cancel the run
        std::mem::forget(_cancel_handle);

        let config = CrawlRunnerConfig {
            worker_program: "/bin/sh".to_string(),
            worker_base_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            ..config
        };
        let sink = ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, Duration::from_millis(0));
        let runner = CrawlJobRunner::new(
            store.clone(),
            bus.clone(),
            sink,
            config,
            &row.id,
            options,
            control_rx,
            cancel,
        );

        Fixture {
            store,
            bus,
            task_id: row.id,
            control_tx,
            runner,
        }
    }

    fn fast_config() -> CrawlRunnerConfig {
        CrawlRunnerConfig {
            tick: Duration::from_millis(20),
            cancel_grace: Duration::from_millis(300),
            watchdog: WatchdogConfig {
                silence: Duration::from_secs(30),
                stall: Duration::from_secs(60),
                first_output: Duration::from_secs(10),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_crawl() {
        let script = r#"
printf 'PROGRESS {"current":1,"total":3}\n'
printf 'PROGRESS {"current":2,"total":3}\n'
printf 'PROGRESS {"current":3,"total":3,"stage":"done","message":"3 of 3"}\n'
exit 0
"#;
        let f = fixture(script, fast_config()).await;
        let mut sub = f.bus.subscribe(&[Topic::TaskCompleted]);

        let status = f.runner.run().await;
        assert_eq!(status, TaskStatus::Completed);

        let row = f.store.get_task(&f.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(row.progress_current, 3);
        assert_eq!(row.progress_total, 3);
        assert!(row.completed_at.is_some());
        assert!(row.metadata["pid"].is_null());

        // Exactly one task-completed with success=true
        match sub.recv().await.unwrap() {
            Delivery::Event(env) => match env.event {
                crate::events::BusEvent::TaskCompleted { success, summary, .. } => {
                    assert!(success);
                    assert_eq!(summary["pages"], 3);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_error_lines_and_nonzero_exit() {
        let script = r#"
printf 'ERROR {"message":"fetch failed: dns"}\n'
printf 'ERROR {"message":"second error"}\n'
exit 3
"#;
        let f = fixture(script, fast_config()).await;
        let status = f.runner.run().await;
        assert_eq!(status, TaskStatus::Failed);

        let row = f.store.get_task(&f.task_id).await.unwrap().unwrap();
        // First ERROR message is the one that sticks
        assert!(row.error_message.as_deref().unwrap().contains("fetch failed: dns"));
        assert!(row.error_message.as_deref().unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn test_telemetry_lines_persisted() {
        let script = r#"
printf 'QUEUE {"action":"enqueue","url":"https://example.com/world","depth":1,"host":"example.com","reason":"seed","queue_size":1}\n'
printf 'MILESTONE {"kind":"hub-verified","message":"verified /world"}\n'
printf 'PLANNER_STAGE {"stage":"seed","decision":"emitted 1"}\n'
printf 'PROBLEM {"kind":"http-429","scope":"host","target":"example.com","message":"rate limited"}\n'
exit 0
"#;
        let f = fixture(script, fast_config()).await;
        let status = f.runner.run().await;
        assert_eq!(status, TaskStatus::Completed);

        assert_eq!(f.store.list_queue_events(&f.task_id, 10).await.unwrap().len(), 1);
        assert_eq!(f.store.list_milestones(&f.task_id, 10).await.unwrap().len(), 1);
        assert_eq!(f.store.list_planner_stages(&f.task_id, 10).await.unwrap().len(), 1);
        let problems = f.store.list_problems(&f.task_id, 10).await.unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].kind, "http-429");
    }

    #[tokio::test]
    async fn test_cancel_terminates_worker() {
        let script = r#"
printf 'PROGRESS {"current":1,"total":10}\n'
sleep 30
"#;
        let f = fixture(script, fast_config()).await;
        let control = f.control_tx.clone();

        let handle = tokio::spawn(f.runner.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        control.send(CrawlControl::Cancel).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel should finish quickly")
            .unwrap();
        assert_eq!(status, TaskStatus::Cancelled);

        let row = f.store.get_task(&f.task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Cancelled);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_silence_watchdog_kills() {
        let script = r#"
printf 'PROGRESS {"current":1,"total":10}\n'
sleep 30
"#;
        let config = CrawlRunnerConfig {
            tick: Duration::from_millis(20),
            watchdog: WatchdogConfig {
                silence: Duration::from_millis(150),
                stall: Duration::from_secs(60),
                first_output: Duration::from_secs(10),
            },
            ..fast_config()
        };
        let f = fixture(script, config).await;

        let status = tokio::time::timeout(Duration::from_secs(10), f.runner.run())
            .await
            .expect("watchdog should kill the worker");
        assert_eq!(status, TaskStatus::Failed);

        let row = f.store.get_task(&f.task_id).await.unwrap().unwrap();
        assert!(row.error_message.as_deref().unwrap().contains("silence"));

        let problems = f.store.list_problems(&f.task_id, 10).await.unwrap();
        assert!(problems.iter().any(|p| p.kind == "silence"));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_worker() {
        let script = r#"
printf 'ERROR {"message":"disk full","fatal":true}\n'
sleep 30
"#;
        let f = fixture(script, fast_config()).await;
        let status = tokio::time::timeout(Duration::from_secs(5), f.runner.run())
            .await
            .expect("fatal error should stop the worker");
        assert_eq!(status, TaskStatus::Failed);

        let row = f.store.get_task(&f.task_id).await.unwrap().unwrap();
        assert!(row.error_message.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_immediately() {
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let options = CrawlOptions::new("https://example.com/");
        let row = store.create_task("crawl", json!({})).await.unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();

        let (_tx, control_rx) = mpsc::channel(1);
        let (handle, cancel) = cancel_pair();
        std::mem::forget(handle);

        let config = CrawlRunnerConfig {
            worker_program: "/nonexistent/worker-binary".to_string(),
            ..fast_config()
        };
        let sink = ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, Duration::from_millis(0));
        let runner =
            CrawlJobRunner::new(store.clone(), bus, sink, config, &row.id, options, control_rx, cancel);

        let status = runner.run().await;
        assert_eq!(status, TaskStatus::Failed);

        let row = store.get_task(&row.id).await.unwrap().unwrap();
        assert!(row.error_message.as_deref().unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_planning_seeds_worker_and_persists_telemetry() {
        use crate::frontier::FrontierConfig;
        use crate::planner::{PlannerConfig, SeedContext};
        use crate::runner::planning::JobPlanning;

        let script = r#"
printf 'MILESTONE {"kind":"hub-verified","target":"https://example.com/world/france","message":"verified"}\n'
printf 'PROGRESS {"current":1,"total":1}\n'
exit 0
"#;
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let options = CrawlOptions::new("https://example.com/");
        let row = store
            .create_task("crawl", serde_json::to_value(&options).unwrap())
            .await
            .unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();

        let (control_tx, control_rx) = mpsc::channel(8);
        let (cancel_handle, cancel) = cancel_pair();
        std::mem::forget(cancel_handle);
        let _keep = control_tx;

        let config = CrawlRunnerConfig {
            worker_program: "/bin/sh".to_string(),
            worker_base_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            ..fast_config()
        };
        let seed_ctx = SeedContext {
            topics: vec!["world".into()],
            places: Vec::new(),
        };
        let planning = JobPlanning::new(&row.id, &options, PlannerConfig::default(), FrontierConfig::default(), seed_ctx);
        let sink = ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, Duration::from_millis(0));
        let runner = CrawlJobRunner::new(
            store.clone(),
            bus.clone(),
            sink,
            config,
            &row.id,
            options,
            control_rx,
            cancel,
        )
        .with_planning(planning);

        let status = runner.run().await;
        assert_eq!(status, TaskStatus::Completed);

        // Seed plan telemetry was persisted: enqueues and dequeues for the
        // start URL and the topic hub
        let queue_events = store.list_queue_events(&row.id, 50).await.unwrap();
        assert!(queue_events.iter().any(|e| e.url == "https://example.com/" && e.action == QueueAction::Enqueue));
        assert!(queue_events.iter().any(|e| e.url == "https://example.com/world" && e.action == QueueAction::Dequeue));

        let stages = store.list_planner_stages(&row.id, 10).await.unwrap();
        assert!(stages.iter().any(|s| s.stage == "seed"));
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let script = r#"
printf 'PROGRESS {"current":1,"total":3}\n'
sleep 0.6
printf 'PROGRESS {"current":2,"total":3}\n'
sleep 0.6
printf 'PROGRESS {"current":3,"total":3}\n'
exit 0
"#;
        let f = fixture(script, fast_config()).await;
        let control = f.control_tx.clone();
        let store = f.store.clone();
        let task_id = f.task_id.clone();

        let handle = tokio::spawn(f.runner.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        control.send(CrawlControl::Pause).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let row = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Paused);

        control.send(CrawlControl::Resume).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .expect("worker should finish after resume")
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let row = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(row.progress_current, 3);
    }
}
