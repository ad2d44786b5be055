//! newscrawld CLI entry point
//!
//! Wires dependencies (store, bus, orchestrator, facade) from configuration
//! and dispatches subcommands. All orchestration behavior lives behind the
//! facade so the CLI and the HTTP adapter stay thin and identical.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use newsdaemon::cli::{Cli, Command, CrawlCommand, DaemonCommand, PlaceHubsCommand, TaskCommand};
use newsdaemon::config::Config;
use newsdaemon::daemon::DaemonManager;
use newsdaemon::domain::CrawlOptions;
use newsdaemon::events::Delivery;
use newsdaemon::facade::{self, Deps, TaskListOptions};
use newsdaemon::orchestrator::Orchestrator;
use newsdaemon::tasks::{PlaceHubGuessOptions, register_builtin_tasks};
use newsstore::{TaskRow, TaskStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("newscrawld")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::options()
        .create(true)
        .append(true)
        .open(log_dir.join("newscrawld.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

/// Build the dependency bundle every command runs against
fn build_deps(config: &Config) -> Result<Deps> {
    let store = TaskStore::open(&config.storage.db_path)
        .with_context(|| format!("cannot open store at {}", config.storage.db_path.display()))?;
    let bus = Arc::new(config.event_bus());
    let orchestrator = Orchestrator::new(store, bus, config.orchestrator_config());
    register_builtin_tasks(
        &orchestrator,
        config.storage.pages_dir.clone(),
        config.readiness.min_fetches,
    )?;
    Ok(Deps::new(orchestrator, config))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.log_level.as_deref()) {
        eprintln!("Warning: logging setup failed: {e}");
    }

    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref())?;
    debug!(json = cli.json, "dispatching command");

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Crawl { command } => crawl_command(command, &config, cli.json).await,
        Command::Task { command } => task_command(command, &config, cli.json).await,
        Command::PlaceHubs { command } => place_hubs_command(command, &config, cli.json).await,
        Command::Events => tail_events(&config).await,
        Command::Status => status_command(&config, cli.json).await,
        Command::Daemon { command } => daemon_command(command, cli.json),
    }
}

/// Wait for ctrl-c or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn serve(config: Config) -> Result<()> {
    let deps = build_deps(&config)?;

    let daemon = DaemonManager::new();
    if let Err(e) = daemon.register_self() {
        tracing::warn!(error = %e, "could not write pid file");
    }

    deps.orchestrator.start().await?;
    info!(bind = %config.http.bind, "newscrawld serving");
    println!("{} listening on {}", "newscrawld".green().bold(), config.http.bind);

    newsdaemon::http::serve_until(deps.clone(), &config.http.bind, shutdown_signal()).await?;

    info!("shutdown requested, stopping tasks");
    let grace = Duration::from_secs(config.watchdogs.cancel_grace_secs + 5);
    deps.orchestrator.shutdown(grace).await;
    Ok(())
}

async fn crawl_command(command: CrawlCommand, config: &Config, json: bool) -> Result<()> {
    let deps = build_deps(config)?;
    match command {
        CrawlCommand::Start {
            url,
            max_pages,
            max_depth,
            crawl_type,
            worker_args,
        } => {
            let options = CrawlOptions {
                url,
                max_pages,
                max_depth,
                crawl_type,
                worker_args,
            };
            let started = facade::start_crawl(options, &deps).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&started)?);
            } else {
                println!("Started crawl job {}", started.job_id.green());
                println!("  stage: {}", started.stage);
                println!("  worker args: {}", started.args.join(" "));
            }
        }
        CrawlCommand::List { status, limit } => {
            let rows = facade::list_tasks(
                TaskListOptions {
                    status,
                    task_type: Some("crawl".to_string()),
                    limit: Some(limit),
                },
                &deps,
            )
            .await?;
            print_task_list(&rows, json)?;
        }
    }
    Ok(())
}

async fn task_command(command: TaskCommand, config: &Config, json: bool) -> Result<()> {
    let deps = build_deps(config)?;
    match command {
        TaskCommand::Start { task_type, config } => {
            let payload: serde_json::Value =
                serde_json::from_str(&config).context("--config must be valid JSON")?;
            let row = facade::start_background_task(&task_type, payload, &deps).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&row)?);
            } else {
                println!("Created {} task {}", row.task_type, row.id.green());
            }
        }
        TaskCommand::List { status, task_type, limit } => {
            let rows = facade::list_tasks(
                TaskListOptions {
                    status,
                    task_type,
                    limit: Some(limit),
                },
                &deps,
            )
            .await?;
            print_task_list(&rows, json)?;
        }
        TaskCommand::Show { id } => {
            let row = facade::get_task(&id, &deps).await?;
            let problems = facade::task_problems(&id, 1000, &deps).await?;
            let milestones = facade::task_milestones(&id, 1000, &deps).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task": row,
                        "problems": problems,
                        "milestones": milestones,
                    }))?
                );
            } else {
                print_task(&row);
                println!("  problems: {}, milestones: {}", problems.len(), milestones.len());
                for problem in problems.iter().rev().take(5) {
                    println!("  {} {} - {}", "problem".yellow(), problem.kind, problem.message);
                }
            }
        }
        TaskCommand::Pause { id } => {
            let row = facade::pause_task(&id, &deps).await?;
            print_control_result("paused", &row, json)?;
        }
        TaskCommand::Resume { id } => {
            let row = facade::resume_task(&id, &deps).await?;
            print_control_result("resumed", &row, json)?;
        }
        TaskCommand::Cancel { id } => {
            let row = facade::cancel_task(&id, &deps).await?;
            print_control_result("cancelled", &row, json)?;
        }
        TaskCommand::Delete { id } => {
            facade::delete_task(&id, &deps).await?;
            if json {
                println!("{}", serde_json::json!({ "deleted": id }));
            } else {
                println!("Deleted task {id}");
            }
        }
    }
    Ok(())
}

async fn place_hubs_command(command: PlaceHubsCommand, config: &Config, json: bool) -> Result<()> {
    let deps = build_deps(config)?;
    match command {
        PlaceHubsCommand::Guess { domain, kind, limit, apply } => {
            let options = PlaceHubGuessOptions {
                domains: domain,
                kinds: if kind.is_empty() { vec!["country".to_string()] } else { kind },
                limit,
                apply,
            };
            let report = facade::guess_place_hubs(options, &deps).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Processed {} domains: {} candidates, {} inserted{}",
                    report.batch.processed_domains,
                    report.batch.candidates,
                    report.batch.inserted,
                    if apply { "" } else { " (dry run)" },
                );
                for summary in &report.domain_summaries {
                    let status = if summary.readiness.status == "ready" {
                        summary.readiness.status.green()
                    } else {
                        summary.readiness.status.yellow()
                    };
                    println!("  {} [{}] {} candidates", summary.domain, status, summary.candidates);
                }
                for error in &report.errors {
                    println!("  {} {}", "error:".red(), error);
                }
            }
        }
    }
    Ok(())
}

/// Subscribe to the bus and print events as JSON lines until interrupted
async fn tail_events(config: &Config) -> Result<()> {
    let deps = build_deps(config)?;
    let mut subscription = deps.bus.subscribe_all();
    eprintln!("Tailing events (ctrl-c to stop)...");

    loop {
        tokio::select! {
            delivery = subscription.recv() => match delivery {
                Some(Delivery::Event(envelope)) => println!("{}", serde_json::to_string(&envelope)?),
                Some(Delivery::Lagged { missed }) => {
                    println!("{}", serde_json::json!({ "type": "subscriber-lagged", "missed": missed }));
                }
                Some(Delivery::Heartbeat { .. }) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn status_command(config: &Config, json: bool) -> Result<()> {
    let deps = build_deps(config)?;
    let status = facade::daemon_status(&deps).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let counts = &status.counts;
    println!("{}", "Task counts".bold());
    println!("  total:     {}", counts.total);
    println!("  pending:   {}", counts.pending);
    println!("  resuming:  {}", counts.resuming);
    println!("  running:   {}", counts.running.to_string().green());
    println!("  paused:    {}", counts.paused);
    println!("  completed: {}", counts.completed);
    println!("  failed:    {}", counts.failed.to_string().red());
    println!("  cancelled: {}", counts.cancelled);
    if !status.active.is_empty() {
        println!("{}", "Active".bold());
        for id in &status.active {
            println!("  {id}");
        }
    }
    Ok(())
}

fn daemon_command(command: DaemonCommand, json: bool) -> Result<()> {
    let daemon = DaemonManager::new();
    match command {
        DaemonCommand::Start => {
            let pid = daemon.start()?;
            if json {
                println!("{}", serde_json::json!({ "started": true, "pid": pid }));
            } else {
                println!("Daemon started with PID {pid}");
            }
        }
        DaemonCommand::Stop => {
            daemon.stop()?;
            if json {
                println!("{}", serde_json::json!({ "stopped": true }));
            } else {
                println!("Daemon stopped");
            }
        }
        DaemonCommand::Status => {
            let status = daemon.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if status.running {
                println!("Daemon {} (PID {})", "running".green(), status.pid.unwrap_or(0));
            } else {
                println!("Daemon {}", "stopped".red());
            }
        }
    }
    Ok(())
}

fn print_control_result(verb: &str, row: &TaskRow, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(row)?);
    } else {
        println!("Task {} {} (status: {})", row.id, verb, row.status);
    }
    Ok(())
}

fn print_task(row: &TaskRow) {
    let status = match row.status {
        newsstore::TaskStatus::Running => row.status.to_string().green(),
        newsstore::TaskStatus::Failed => row.status.to_string().red(),
        newsstore::TaskStatus::Paused | newsstore::TaskStatus::Resuming => row.status.to_string().yellow(),
        _ => row.status.to_string().normal(),
    };
    let progress = if row.progress_total > 0 {
        format!("{}/{}", row.progress_current, row.progress_total)
    } else if row.progress_current > 0 {
        format!("{}", row.progress_current)
    } else {
        "-".to_string()
    };
    println!(
        "{}  {:10}  {:9}  {:10}  {}",
        row.id,
        row.task_type,
        status,
        progress,
        row.progress_message.as_deref().unwrap_or(""),
    );
}

fn print_task_list(rows: &[TaskRow], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for row in rows {
        print_task(row);
    }
    Ok(())
}
