//! End-to-end scenarios through the full stack: store, orchestrator,
//! runner, facade and HTTP adapter wired together the way `nd serve` does.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tempfile::tempdir;
use tower::util::ServiceExt;

use newsdaemon::config::Config;
use newsdaemon::events::{Delivery, EventBus, Topic};
use newsdaemon::facade::{self, Deps};
use newsdaemon::orchestrator::{Orchestrator, OrchestratorConfig};
use newsdaemon::runner::{CrawlRunnerConfig, WatchdogConfig};
use newsdaemon::tasks::register_builtin_tasks;
use newsstore::{ProgressUpdate, StatusChange, TaskStatus, TaskStore};

/// Orchestrator config with fast ticks and a scripted /bin/sh worker
fn orchestrator_config(script: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        max_crawl_jobs: 1,
        max_background_tasks: 2,
        poll_interval: Duration::from_millis(20),
        resume_stuck_after: Duration::from_millis(500),
        cancel_grace: Duration::from_millis(500),
        runner: CrawlRunnerConfig {
            worker_program: "/bin/sh".to_string(),
            worker_base_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            tick: Duration::from_millis(20),
            cancel_grace: Duration::from_millis(500),
            watchdog: WatchdogConfig {
                silence: Duration::from_secs(30),
                stall: Duration::from_secs(60),
                first_output: Duration::from_secs(10),
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

fn stack(script: &str, pages_dir: std::path::PathBuf) -> Deps {
    let store = TaskStore::in_memory().unwrap();
    let bus = Arc::new(EventBus::with_defaults());
    let orchestrator = Orchestrator::new(store, bus, orchestrator_config(script));
    register_builtin_tasks(&orchestrator, pages_dir, 1).unwrap();
    Deps::new(orchestrator, &Config::default())
}

async fn wait_for_status(store: &TaskStore, id: &str, want: TaskStatus) -> newsstore::TaskRow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let row = store.get_task(id).await.unwrap().unwrap();
        if row.status == want {
            return row;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck at {} waiting for {want}",
            row.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn happy_path_crawl_via_http() {
    let script = r#"
printf 'PROGRESS {"current":1,"total":3}\n'
printf 'PROGRESS {"current":2,"total":3}\n'
printf 'PROGRESS {"current":3,"total":3}\n'
exit 0
"#;
    let dir = tempdir().unwrap();
    let deps = stack(script, dir.path().to_path_buf());
    deps.orchestrator.start().await.unwrap();

    let mut completed_sub = deps.bus.subscribe(&[Topic::TaskCompleted]);

    let app = newsdaemon::http::router(deps.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/crawls")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"url": "https://example.com/", "maxPages": 3}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = body_json(response).await["jobId"].as_str().unwrap().to_string();

    let row = wait_for_status(&deps.store, &job_id, TaskStatus::Completed).await;
    assert_eq!(row.progress_current, 3);
    assert_eq!(row.progress_total, 3);
    assert!(row.completed_at.is_some());
    assert!(row.started_at.is_some());

    // Exactly one task-completed event, success=true
    let mut completed = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while completed.is_empty() && tokio::time::Instant::now() < deadline {
        if let Some(Delivery::Event(env)) = completed_sub.try_recv() {
            completed.push(env);
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    assert_eq!(completed.len(), 1);
    match &completed[0].event {
        newsdaemon::events::BusEvent::TaskCompleted { success, task_id, .. } => {
            assert!(success);
            assert_eq!(task_id, &job_id);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(completed_sub.try_recv().is_none());
}

#[tokio::test]
async fn pause_and_resume_crawl() {
    let script = r#"
printf 'PROGRESS {"current":1,"total":3}\n'
sleep 0.5
printf 'PROGRESS {"current":2,"total":3}\n'
sleep 0.5
printf 'PROGRESS {"current":3,"total":3}\n'
exit 0
"#;
    let dir = tempdir().unwrap();
    let deps = stack(script, dir.path().to_path_buf());
    deps.orchestrator.start().await.unwrap();

    let started = facade::start_crawl(newsdaemon::domain::CrawlOptions::new("https://example.com/"), &deps)
        .await
        .unwrap();
    wait_for_status(&deps.store, &started.job_id, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    facade::pause_task(&started.job_id, &deps).await.unwrap();
    wait_for_status(&deps.store, &started.job_id, TaskStatus::Paused).await;

    facade::resume_task(&started.job_id, &deps).await.unwrap();
    let row = wait_for_status(&deps.store, &started.job_id, TaskStatus::Completed).await;
    assert_eq!(row.progress_current, 3);
}

#[tokio::test]
async fn crash_recovery_resumes_compression() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("tasks.db");
    let pages_dir = dir.path().join("pages");
    std::fs::create_dir_all(&pages_dir).unwrap();
    for i in 0..3 {
        std::fs::write(pages_dir.join(format!("page{i}.html")), "<p>x</p>".repeat(400)).unwrap();
    }

    // First process: a compression task is mid-flight when it dies
    let task_id = {
        let store = TaskStore::open(&db_path).unwrap();
        let row = store.create_task("compress", json!({})).await.unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();
        store
            .update_progress(&row.id, ProgressUpdate::counters(42, 100))
            .await
            .unwrap();
        store.shutdown().await.unwrap();
        row.id
    };

    // Restart: the interrupted task is found, resumed, and runs to completion
    let store = TaskStore::open(&db_path).unwrap();
    let interrupted = store.find_interrupted_tasks().await.unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].id, task_id);

    let bus = Arc::new(EventBus::with_defaults());
    let orchestrator = Orchestrator::new(store.clone(), bus, orchestrator_config("exit 0"));
    register_builtin_tasks(&orchestrator, pages_dir, 1).unwrap();
    orchestrator.start().await.unwrap();

    let row = wait_for_status(&store, &task_id, TaskStatus::Completed).await;
    assert!(row.resume_started_at.is_none());
    assert_eq!(row.progress_current, row.progress_total);
}

#[tokio::test]
async fn background_task_via_http_and_telemetry() {
    let dir = tempdir().unwrap();
    let pages_dir = dir.path().join("pages");
    std::fs::create_dir_all(&pages_dir).unwrap();
    std::fs::write(pages_dir.join("a.example__home.html"), "<p>x</p>".repeat(200)).unwrap();

    let deps = stack("exit 0", pages_dir);
    deps.orchestrator.start().await.unwrap();

    let app = newsdaemon::http::router(deps.clone());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tasks/analyze")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let task_id = body_json(response).await["taskId"].as_str().unwrap().to_string();

    let row = wait_for_status(&deps.store, &task_id, TaskStatus::Completed).await;
    assert_eq!(row.metadata["stats"]["pages"], 1);

    let response = app
        .oneshot(Request::builder().uri(format!("/tasks/{task_id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn gazetteer_then_place_hub_guess_applies() {
    let dir = tempdir().unwrap();
    let deps = stack("exit 0", dir.path().to_path_buf());
    deps.orchestrator.start().await.unwrap();

    // Ingest a seed gazetteer
    let row = facade::start_background_task(
        "ingest-gazetteer",
        json!({"places": [
            {"name": "France", "kind": "country"},
            {"name": "Germany", "kind": "country"},
        ]}),
        &deps,
    )
    .await
    .unwrap();
    wait_for_status(&deps.store, &row.id, TaskStatus::Completed).await;

    // Preseed crawl signals for the target domain
    let job = deps.store.create_task("crawl", json!({})).await.unwrap();
    deps.store
        .append_queue_event(newsstore::QueueEvent {
            id: 0,
            task_id: job.id,
            ts: newsstore::now_ms(),
            action: newsstore::QueueAction::Dequeue,
            url: "https://a.example/".into(),
            depth: None,
            host: Some("a.example".into()),
            reason: None,
            queue_size: None,
            role: None,
            depth_bucket: None,
        })
        .await
        .unwrap();

    let report = facade::guess_place_hubs(
        newsdaemon::tasks::PlaceHubGuessOptions {
            domains: vec!["a.example".into()],
            kinds: vec!["country".into()],
            limit: 5,
            apply: true,
        },
        &deps,
    )
    .await
    .unwrap();

    assert_eq!(report.batch.inserted, 2);
    let hubs = deps.store.list_place_hubs("a.example", 10).await.unwrap();
    assert_eq!(hubs.len(), 2);
    assert!(hubs.iter().any(|h| h.url == "https://a.example/world/france"));
}
