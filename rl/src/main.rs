//! ralphloop - Ralph Wiggum loop runner
//!
//! CLI entry point: runs, resumes and inspects sessions.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail, eyre};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ralphloop::cli::{Cli, Command, get_log_path, render_event};
use ralphloop::config::Config;
use ralphloop::domain::summarize;
use ralphloop::events::{Event, EventBus};
use ralphloop::feedback::LearningStore;
use ralphloop::orchestrator::{Orchestrator, OrchestratorHandle, RunOptions, RunSummary, SessionOutcome};
use ralphloop::scheduler::compute_execution_groups;
use ralphloop::session::{IterationLogStore, SessionStore};
use ralphloop::stats::UsageStatsStore;
use ralphloop::tasks::{JsonTaskFile, TaskSource};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Log to a file; the terminal belongs to the agent's output
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;
    let project_dir = std::env::current_dir().context("Failed to read the current directory")?;

    info!(agent = %config.agent.command, ?project_dir, "ralphloop loaded config");

    match cli.command {
        Command::Run {
            iterations,
            parallel,
            max_concurrent,
            no_verify,
        } => {
            let options = RunOptions {
                iterations,
                parallel: parallel.then_some(true),
                max_concurrent,
                skip_verification: no_verify,
            };
            cmd_run(config, project_dir, options, false).await
        }
        Command::Resume {
            iterations,
            no_verify,
            sequential,
        } => {
            let options = RunOptions {
                iterations,
                parallel: sequential.then_some(false),
                skip_verification: no_verify,
                ..Default::default()
            };
            cmd_run(config, project_dir, options, true).await
        }
        Command::Status => cmd_status(&config, &project_dir).await,
        Command::Validate => cmd_validate(&config, &project_dir).await,
        Command::Clear => cmd_clear(&config, &project_dir),
    }
}

/// Run or resume a session, printing events as they arrive
async fn cmd_run(config: Config, project_dir: PathBuf, options: RunOptions, resume: bool) -> Result<()> {
    let mut orchestrator = Orchestrator::new(config, project_dir);
    let presenter = spawn_presenter(&orchestrator.event_bus());
    let signals = spawn_signal_handler(orchestrator.handle());

    let result = if resume {
        orchestrator.resume(options).await
    } else {
        orchestrator.run(options).await
    };
    signals.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            presenter.abort();
            return Err(e);
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), presenter).await.is_err() {
        warn!("cmd_run: presenter did not finish");
    }

    print_summary(&summary);
    if summary.outcome == SessionOutcome::Fatal {
        return Err(eyre!(
            "{}",
            summary.message.unwrap_or_else(|| "fatal agent error".to_string())
        ));
    }
    Ok(())
}

/// Print every shown event until the session ends
fn spawn_presenter(bus: &EventBus) -> JoinHandle<()> {
    let mut subscription = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let finished = matches!(event, Event::SessionCompleted { .. } | Event::SessionStopped { .. });
            if let Some(line) = render_event(&event) {
                println!("{}", line);
            }
            if finished {
                break;
            }
        }
    })
}

/// First Ctrl-C / SIGTERM stops the session cleanly, a second one exits
fn spawn_signal_handler(handle: OrchestratorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut requested = false;
        loop {
            if wait_for_shutdown_signal().await.is_err() {
                warn!("Failed to listen for shutdown signals");
                return;
            }
            if requested {
                eprintln!("{}", "Forced exit".red());
                std::process::exit(130);
            }
            requested = true;
            eprintln!(
                "\n{}",
                "Stopping: terminating the agent and saving the session (again to force)".yellow()
            );
            handle.stop();
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => warn!("SIGINT received"),
        _ = sigterm.recv() => warn!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn print_summary(summary: &RunSummary) {
    let outcome = match summary.outcome {
        SessionOutcome::Complete => summary.outcome.as_str().green().bold(),
        SessionOutcome::Fatal => summary.outcome.as_str().red().bold(),
        _ => summary.outcome.as_str().yellow().bold(),
    };
    println!();
    println!("Session {}: {}", summary.session_id, outcome);
    println!(
        "Iterations: {} (last: {}), tasks done: {}/{}",
        summary.iterations_run, summary.last_iteration, summary.tasks_done, summary.tasks_total
    );
    if let Some(message) = &summary.message {
        println!("{} {}", "Reason:".bold(), message);
    }
    if let Some(suggestion) = &summary.suggestion {
        println!("{} {}", "Suggestion:".bold(), suggestion);
    }
    if matches!(
        summary.outcome,
        SessionOutcome::Stopped | SessionOutcome::MaxIterations | SessionOutcome::MaxRuntime | SessionOutcome::TasksFailed
    ) {
        println!("Continue with: rl resume");
    }
}

/// Show the task list, the session and its iteration history
async fn cmd_status(config: &Config, project_dir: &Path) -> Result<()> {
    let state_dir = project_dir.join(&config.paths.state_dir);
    let tasks = JsonTaskFile::new(project_dir.join(&config.paths.prd_file));

    match tasks.load().await? {
        Some(list) => {
            println!(
                "{} {} ({}/{} tasks done)",
                "Project:".bold(),
                list.project,
                list.done_count(),
                list.tasks.len()
            );
            if let Some(next) = list.next_task_with_index() {
                println!("{} {} (#{})", "Next task:".bold(), next.title, next.index + 1);
            }
        }
        None => println!("No task list at {}", tasks.location()),
    }

    let sessions = SessionStore::new(state_dir.clone());
    match sessions.load()? {
        Some(session) => {
            println!();
            println!("{} {} ({})", "Session:".bold(), session.id, session.status);
            println!(
                "Iteration {} of {}, {} remaining",
                session.current_iteration,
                session.total_iterations,
                session.remaining_iterations()
            );
            let stats = &session.statistics;
            println!(
                "Succeeded {}, failed {}, success rate {:.0}%, average {}ms",
                stats.successful_iterations, stats.failed_iterations, stats.success_rate, stats.average_duration_ms
            );
            if let Some(parallel) = session.parallel_state.as_ref().filter(|p| p.is_parallel_mode) {
                println!(
                    "Parallel: group {} of {}, up to {} agents",
                    parallel.current_group_index + 1,
                    parallel.execution_groups.len(),
                    parallel.max_concurrent_tasks
                );
            }

            let logs = IterationLogStore::new(state_dir.clone()).read(&session.id)?;
            if !logs.is_empty() {
                let summary = summarize(&logs);
                let by_status: Vec<String> = summary
                    .by_status
                    .iter()
                    .map(|(status, count)| format!("{} {}", count, status))
                    .collect();
                println!("{} {}", "Iterations:".bold(), by_status.join(", "));
                println!(
                    "Retries {} ({} iterations), verification failures {}, decompositions {}",
                    summary.total_retries,
                    summary.retried_iterations,
                    summary.verification_failures,
                    summary.decompositions
                );
            }
        }
        None => println!("\nNo active session"),
    }

    let learning = LearningStore::open(&state_dir, config.learning.clone());
    if !learning.memory().is_empty() {
        println!("{} {} entries", "Learnings:".bold(), learning.memory().len());
    }

    let usage = UsageStatsStore::default_location().load();
    if usage.sessions_started > 0 {
        println!(
            "{} {} sessions ({} completed), {} iterations, {:.0}% successful",
            "Usage:".bold(),
            usage.sessions_started,
            usage.sessions_completed,
            usage.total_iterations,
            usage.success_rate()
        );
    }
    Ok(())
}

/// Check task dependencies and print the execution groups
async fn cmd_validate(config: &Config, project_dir: &Path) -> Result<()> {
    let tasks = JsonTaskFile::new(project_dir.join(&config.paths.prd_file));
    let Some(list) = tasks.load().await? else {
        bail!("No task list at {}", tasks.location());
    };

    match compute_execution_groups(&list) {
        Ok(groups) => {
            println!("{} {} tasks in {} groups", "✓".green(), list.tasks.len(), groups.len());
            for group in &groups {
                println!("  group {}: {}", group.index + 1, group.task_ids.join(", "));
            }
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("{} {}", "✗".red(), error);
            }
            bail!("{} dependency problem(s) in {}", errors.len(), tasks.location())
        }
    }
}

/// Delete the stored session
fn cmd_clear(config: &Config, project_dir: &Path) -> Result<()> {
    let sessions = SessionStore::new(project_dir.join(&config.paths.state_dir));
    if sessions.delete()? {
        println!("Session cleared");
    } else {
        println!("No session to clear");
    }
    Ok(())
}
