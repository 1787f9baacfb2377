//! ralphloop configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main ralphloop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How the agent CLI is invoked
    pub agent: AgentConfig,

    /// Retry policy for failed agent attempts
    pub retry: RetryConfig,

    /// Iteration budget and pacing
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,

    /// Dependency-driven parallel mode
    pub parallel: ParallelConfig,

    /// Build/test/lint gating
    pub verification: VerificationConfig,

    /// Per-task branch workflow
    pub branch: BranchConfig,

    /// Cross-iteration learning memory
    pub learning: LearningConfig,

    /// External notification hook
    pub notifications: NotificationConfig,

    /// File locations
    pub paths: PathsConfig,
}

impl Config {
    /// Reject settings the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(eyre::eyre!("agent.command must not be empty"));
        }
        if self.loop_.max_iterations == 0 {
            return Err(eyre::eyre!("loop.max-iterations must be at least 1"));
        }
        if self.parallel.max_concurrent_tasks == 0 {
            return Err(eyre::eyre!("parallel.max-concurrent-tasks must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .ralphloop.yml
        let local_config = PathBuf::from(".ralphloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/ralphloop/ralphloop.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ralphloop").join("ralphloop.yml");
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
}

/// Agent CLI invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to run
    pub command: String,

    /// Arguments passed before the prompt
    pub args: Vec<String>,

    /// Write the prompt to stdin (otherwise it is the last argument)
    #[serde(rename = "prompt-via-stdin")]
    pub prompt_via_stdin: bool,

    /// Hard deadline per attempt in milliseconds (0 disables)
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Kill the agent after this long without output (0 disables)
    #[serde(rename = "stuck-threshold-ms")]
    pub stuck_threshold_ms: u64,

    /// Bytes of raw output kept per attempt
    #[serde(rename = "max-output-history-bytes")]
    pub max_output_history_bytes: usize,

    /// Minimum interval between output events
    #[serde(rename = "output-throttle-ms")]
    pub output_throttle_ms: u64,

    /// Time between SIGTERM and SIGKILL
    #[serde(rename = "force-kill-grace-ms")]
    pub force_kill_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            prompt_via_stdin: true,
            timeout_ms: 1_800_000,
            stuck_threshold_ms: 300_000,
            max_output_history_bytes: 1_048_576,
            output_throttle_ms: 100,
            force_kill_grace_ms: 5000,
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base delay; doubled on every retry
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Append a failure analysis to the next attempt's prompt
    #[serde(rename = "retry-with-context")]
    pub retry_with_context: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5000,
            retry_with_context: true,
        }
    }
}

/// Iteration budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Pause between iterations
    #[serde(rename = "iteration-delay-ms")]
    pub iteration_delay_ms: u64,

    /// Wall-clock budget for the whole run (0 disables)
    #[serde(rename = "max-runtime-ms")]
    pub max_runtime_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            iteration_delay_ms: 2000,
            max_runtime_ms: 0,
        }
    }
}

/// Parallel mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,

    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_tasks: 3,
        }
    }
}

/// Verification checks run after an iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,

    #[serde(rename = "build-command")]
    pub build_command: Option<String>,

    #[serde(rename = "test-command")]
    pub test_command: Option<String>,

    #[serde(rename = "lint-command")]
    pub lint_command: Option<String>,

    /// Per-check timeout
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            build_command: None,
            test_command: None,
            lint_command: None,
            timeout_ms: 600_000,
        }
    }
}

/// Per-task branch workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub enabled: bool,

    /// Prefix for generated branch names
    pub prefix: String,

    #[serde(rename = "auto-commit")]
    pub auto_commit: bool,

    #[serde(rename = "auto-push")]
    pub auto_push: bool,

    #[serde(rename = "create-pr")]
    pub create_pr: bool,

    /// Check out the base branch again after each task
    #[serde(rename = "return-to-base")]
    pub return_to_base: bool,

    /// Remote used for push and provider detection
    pub remote: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "ralph/".to_string(),
            auto_commit: true,
            auto_push: false,
            create_pr: false,
            return_to_base: true,
            remote: "origin".to_string(),
        }
    }
}

/// Learning memory retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,

    #[serde(rename = "max-lessons")]
    pub max_lessons: usize,

    #[serde(rename = "max-patterns")]
    pub max_patterns: usize,

    #[serde(rename = "max-avoided")]
    pub max_avoided: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lessons: 50,
            max_patterns: 30,
            max_avoided: 30,
        }
    }
}

/// Notification hook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Shell command run with RALPH_EVENT, RALPH_PROJECT and RALPH_DETAILS set
    pub command: Option<String>,
}

/// File locations, relative to the project directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(rename = "prd-file")]
    pub prd_file: PathBuf,

    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prd_file: PathBuf::from("prd.json"),
            state_dir: PathBuf::from(".ralphloop"),
        }
    }
}
