//! CLI command definitions and terminal rendering of events

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::events::Event;

/// ralphloop - runs an AI coding agent in a loop over a task list
#[derive(Parser)]
#[command(
    name = "rl",
    about = "Ralph Wiggum loop runner for external AI coding agents",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/ralphloop/logs/ralphloop.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start a new session over the task list
    Run {
        /// Iteration budget (overrides loop.max-iterations)
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Run independent tasks concurrently, following their dependencies
        #[arg(short, long)]
        parallel: bool,

        /// Agents alive at once in parallel mode
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,

        /// Skip build/test/lint verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Continue the last stopped or paused session
    Resume {
        /// Extra iterations on top of the remaining budget
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Skip build/test/lint verification
        #[arg(long)]
        no_verify: bool,

        /// Finish a parallel session one task at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Show the current session, iteration history and usage
    Status,

    /// Check the task dependencies and print the execution groups
    Validate,

    /// Delete the stored session
    Clear,
}

/// Log file location
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ralphloop")
        .join("logs")
        .join("ralphloop.log")
}

/// One terminal line for an event; `None` for events not shown
pub fn render_event(event: &Event) -> Option<String> {
    let line = match event {
        Event::AgentOutput { text, .. } => text.trim_end().to_string(),
        Event::AgentRetry {
            retry_count,
            delay_ms,
            error,
            ..
        } => format!(
            "{} retry {} in {}ms: {}",
            "↻".yellow(),
            retry_count,
            delay_ms,
            error
        ),
        Event::AgentError { message, fatal, .. } => {
            let label = if *fatal { "fatal:" } else { "error:" };
            format!("{} {}", label.red().bold(), message)
        }
        Event::IterationStarted {
            iteration, task_title, ..
        } => match task_title {
            Some(title) => format!("{} {}", format!("── iteration {} ──", iteration).cyan().bold(), title),
            None => format!("{}", format!("── iteration {} ──", iteration).cyan().bold()),
        },
        Event::IterationCompleted { iteration, status, .. } => {
            format!("{} iteration {}: {}", "•".bold(), iteration, status)
        }
        Event::IterationDelay {
            next_iteration,
            delay_ms,
            ..
        } => format!("{}", format!("next iteration {} in {}ms", next_iteration, delay_ms).dimmed()),
        Event::SessionStarted {
            total_iterations,
            parallel,
            ..
        } => {
            let mode = if *parallel { "parallel" } else { "standard" };
            format!("{} {} iterations, {} mode", "session started:".bold(), total_iterations, mode)
        }
        Event::SessionResumed {
            from_iteration,
            remaining_iterations,
            ..
        } => format!(
            "{} after iteration {}, {} remaining",
            "session resumed:".bold(),
            from_iteration,
            remaining_iterations
        ),
        Event::SessionPaused { iteration, .. } => format!("{} at iteration {}", "paused".yellow(), iteration),
        Event::SessionStopped { reason, .. } => format!("{} {}", "stopped:".yellow().bold(), reason),
        Event::SessionCompleted {
            outcome, iterations, ..
        } => format!("{} {} after {} iteration(s)", "session finished:".bold(), outcome, iterations),
        Event::ParallelGroupStarted {
            group_index, task_ids, ..
        } => format!(
            "{} {}",
            format!("── group {} ──", group_index + 1).cyan().bold(),
            task_ids.join(", ")
        ),
        Event::ParallelGroupCompleted {
            group_index,
            completed,
            failed,
            ..
        } => format!("group {}: {} completed, {} failed", group_index + 1, completed, failed),
        Event::ParallelTaskStarted { task_id, task_title, .. } => format!("  ▶ {} {}", task_id, task_title),
        Event::ParallelTaskCompleted {
            task_id,
            success,
            error,
            ..
        } => match (success, error) {
            (true, _) => format!("  {} {}", "✓".green(), task_id),
            (false, Some(error)) => format!("  {} {}: {}", "✗".red(), task_id, error),
            (false, None) => format!("  {} {}", "✗".red(), task_id),
        },
        Event::VerificationCompleted {
            passed, failed_checks, ..
        } => {
            if *passed {
                format!("{} verification passed", "✓".green())
            } else {
                format!("{} verification failed: {}", "✗".red(), failed_checks.join(", "))
            }
        }
        Event::TaskDecomposed {
            original_task,
            subtask_count,
            ..
        } => format!("split '{}' into {} subtasks", original_task, subtask_count),
        Event::Error { context, message, .. } => format!("{} [{}] {}", "error:".red().bold(), context, message),
        Event::Warning { context, message, .. } => format!("{} [{}] {}", "warning:".yellow(), context, message),
        Event::AgentStarted { .. } | Event::AgentCompleted { .. } | Event::VerificationStarted { .. } => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IterationStatus;

    #[test]
    fn test_cli_parse_run_defaults() {
        let cli = Cli::parse_from(["rl", "run"]);
        assert_eq!(
            cli.command,
            Command::Run {
                iterations: None,
                parallel: false,
                max_concurrent: None,
                no_verify: false,
            }
        );
    }

    #[test]
    fn test_cli_parse_run_flags() {
        let cli = Cli::parse_from(["rl", "run", "-n", "5", "--parallel", "-j", "2", "--no-verify"]);
        assert_eq!(
            cli.command,
            Command::Run {
                iterations: Some(5),
                parallel: true,
                max_concurrent: Some(2),
                no_verify: true,
            }
        );
    }

    #[test]
    fn test_cli_parse_resume() {
        let cli = Cli::parse_from(["rl", "resume", "--iterations", "3"]);
        assert_eq!(
            cli.command,
            Command::Resume {
                iterations: Some(3),
                no_verify: false,
                sequential: false,
            }
        );
    }

    #[test]
    fn test_cli_resume_sequential() {
        let cli = Cli::parse_from(["rl", "resume", "--sequential"]);
        assert_eq!(
            cli.command,
            Command::Resume {
                iterations: None,
                no_verify: false,
                sequential: true,
            }
        );
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["rl", "-c", "/path/to/config.yml", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert_eq!(cli.command, Command::Status);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["rl"]).is_err());
    }

    #[test]
    fn test_render_event() {
        colored::control::set_override(false);
        let line = render_event(&Event::IterationCompleted {
            execution_id: "s".to_string(),
            iteration: 2,
            status: IterationStatus::VerificationFailed,
        })
        .unwrap();
        assert_eq!(line, "• iteration 2: verification_failed");

        let hidden = Event::AgentStarted {
            execution_id: "s".to_string(),
            attempt: 1,
            command: "claude".to_string(),
        };
        assert!(render_event(&hidden).is_none());
    }
}
