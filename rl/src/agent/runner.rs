//! Agent runner: one invocation of the agent CLI, with retries
//!
//! A single attempt goes spawn -> streaming -> {completed | timed out | stuck | aborted}.
//! [`AgentRunner::run`] wraps attempts in the classify / backoff / re-invoke loop.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::classifier::{FailureCategory, analyze_failure, classify_error, excerpt};
use super::prompt::with_retry_context;
use super::registry::{AbortSignal, ProcessRegistry};
use super::stream::{OutputThrottle, parse_line};
use crate::config::Config;
use crate::events::EventEmitter;

/// Printed by the agent once its current task is done
pub const COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Upper bound on the stall-check period
const MAX_STALL_CHECK: Duration = Duration::from_secs(30);

/// Delay before retry number `retry_index + 1`: `base * 2^retry_index`
pub fn backoff_delay(base: Duration, retry_index: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    match 2u32.checked_pow(retry_index) {
        Some(factor) => base.saturating_mul(factor),
        None => Duration::MAX,
    }
}

/// How the agent is invoked
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: String,
    pub args: Vec<String>,
    /// Write the prompt to stdin instead of passing it as the last argument
    pub prompt_via_stdin: bool,
    pub working_dir: PathBuf,
    /// Hard deadline per attempt; zero disables
    pub timeout: Duration,
    /// Kill after this long without output; zero disables
    pub stuck_threshold: Duration,
    pub max_output_history_bytes: usize,
    pub output_throttle: Duration,
    pub force_kill_grace: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_with_context: bool,
}

impl AgentSettings {
    pub fn from_config(config: &Config, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.agent.command.clone(),
            args: config.agent.args.clone(),
            prompt_via_stdin: config.agent.prompt_via_stdin,
            working_dir: working_dir.into(),
            timeout: Duration::from_millis(config.agent.timeout_ms),
            stuck_threshold: Duration::from_millis(config.agent.stuck_threshold_ms),
            max_output_history_bytes: config.agent.max_output_history_bytes,
            output_throttle: Duration::from_millis(config.agent.output_throttle_ms),
            force_kill_grace: Duration::from_millis(config.agent.force_kill_grace_ms),
            max_retries: config.retry.max_retries,
            retry_delay: Duration::from_millis(config.retry.retry_delay_ms),
            retry_with_context: config.retry.retry_with_context,
        }
    }

    fn stall_check_period(&self) -> Duration {
        (self.stuck_threshold / 4).clamp(Duration::from_millis(10), MAX_STALL_CHECK)
    }
}

/// What went wrong on a retried attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    /// 1-based retry number
    pub attempt: u32,
    pub category: FailureCategory,
    pub root_cause: String,
    pub error: String,
}

/// Result of [`AgentRunner::run`]
#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Raw stdout, bounded to the configured history size
    pub output: String,
    /// Text extracted from the stream, bounded the same way
    pub text: String,
    /// The raw output carried the completion sentinel
    pub is_complete: bool,
    pub error: Option<String>,
    pub suggestion: Option<String>,
    pub retry_count: u32,
    pub is_fatal: bool,
    pub aborted: bool,
    pub retry_contexts: Vec<RetryContext>,
}

/// Text kept as a bounded tail
#[derive(Debug)]
struct TailBuffer {
    buf: String,
    max: usize,
}

impl TailBuffer {
    fn new(max: usize) -> Self {
        Self { buf: String::new(), max }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.max > 0 && self.buf.len() > self.max {
            let mut cut = self.buf.len() - self.max;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

/// Outcome of a single attempt
#[derive(Debug, Default)]
struct Attempt {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    text: String,
    is_complete: bool,
    timed_out: bool,
    stuck: bool,
    aborted: bool,
    spawn_error: Option<String>,
}

impl Attempt {
    fn succeeded(&self) -> bool {
        self.spawn_error.is_none() && !self.timed_out && !self.stuck && !self.aborted && self.exit_code == Some(0)
    }
}

/// Runs the agent CLI
#[derive(Clone)]
pub struct AgentRunner {
    settings: Arc<AgentSettings>,
    registry: Arc<ProcessRegistry>,
    emitter: EventEmitter,
}

impl AgentRunner {
    pub fn new(settings: AgentSettings, registry: Arc<ProcessRegistry>, emitter: EventEmitter) -> Self {
        debug!(command = %settings.command, "AgentRunner::new: called");
        Self {
            settings: Arc::new(settings),
            registry,
            emitter,
        }
    }

    /// Same runner, events tagged with another execution id
    pub fn with_emitter(&self, emitter: EventEmitter) -> Self {
        Self {
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            emitter,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run the agent under `id` until success, a fatal error, abort, or retries run out
    ///
    /// The retry counter and the per-id abort flag are reset on entry; a
    /// global abort stays in force.
    pub async fn run(&self, id: &str, prompt: &str) -> AgentRunResult {
        debug!(%id, prompt_len = prompt.len(), "AgentRunner::run: called");
        self.registry.reset_retry(id);
        self.registry.reset_abort(id);
        let abort = self.registry.abort_signal(id);

        let settings = &self.settings;
        let mut retry_count = 0u32;
        let mut retry_contexts = Vec::new();
        let mut current_prompt = prompt.to_string();

        loop {
            if abort.is_aborted() {
                return self.aborted_result(retry_count, retry_contexts, None);
            }

            self.emitter.agent_started(retry_count + 1, &settings.command);
            let attempt = self.run_once(id, &current_prompt, &abort).await;

            if attempt.aborted || abort.is_aborted() {
                info!(%id, "AgentRunner::run: aborted");
                return self.aborted_result(retry_count, retry_contexts, Some(attempt));
            }

            if attempt.succeeded() {
                debug!(%id, retry_count, is_complete = attempt.is_complete, "AgentRunner::run: attempt succeeded");
                self.emitter
                    .agent_completed(true, attempt.exit_code, attempt.is_complete, retry_count);
                return AgentRunResult {
                    success: true,
                    exit_code: attempt.exit_code,
                    output: attempt.stdout,
                    text: attempt.text,
                    is_complete: attempt.is_complete,
                    retry_count,
                    retry_contexts,
                    ..Default::default()
                };
            }

            let error = attempt_error(&attempt, settings);
            let classified = match (attempt.timed_out, attempt.stuck) {
                (false, false) => classify_error(&format!("{}\n{}", error, attempt.stderr), attempt.exit_code),
                _ => classify_error(&error, None),
            };
            self.emitter.agent_error(&error, classified.is_fatal());

            if classified.is_fatal() {
                warn!(%id, code = classified.code, %error, "AgentRunner::run: fatal error");
                self.emitter
                    .agent_completed(false, attempt.exit_code, attempt.is_complete, retry_count);
                return AgentRunResult {
                    exit_code: attempt.exit_code,
                    output: attempt.stdout,
                    text: attempt.text,
                    is_complete: attempt.is_complete,
                    error: Some(error),
                    suggestion: classified.suggestion,
                    retry_count,
                    is_fatal: true,
                    retry_contexts,
                    ..Default::default()
                };
            }

            if retry_count >= settings.max_retries {
                warn!(%id, retry_count, %error, "AgentRunner::run: retries exhausted");
                self.emitter
                    .agent_completed(false, attempt.exit_code, attempt.is_complete, retry_count);
                return AgentRunResult {
                    exit_code: attempt.exit_code,
                    output: attempt.stdout,
                    text: attempt.text,
                    is_complete: attempt.is_complete,
                    error: Some(format!("{} (after {} retries)", error, retry_count)),
                    retry_count,
                    retry_contexts,
                    ..Default::default()
                };
            }

            let delay = backoff_delay(settings.retry_delay, retry_count);
            retry_count = self.registry.increment_retry(id);

            let analysis = analyze_failure(
                &format!("{}\n{}\n{}", error, attempt.stderr, excerpt(&attempt.stdout, 2000)),
                attempt.exit_code,
            );
            retry_contexts.push(RetryContext {
                attempt: retry_count,
                category: analysis.category,
                root_cause: analysis.root_cause.clone(),
                error: error.clone(),
            });
            if settings.retry_with_context {
                current_prompt = with_retry_context(prompt, Some(&analysis.context_injection));
            }

            info!(%id, retry_count, delay_ms = delay.as_millis() as u64, %error, "AgentRunner::run: retrying");
            self.emitter.agent_retry(retry_count, delay.as_millis() as u64, &error);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.cancelled() => {
                    debug!(%id, "AgentRunner::run: aborted during backoff");
                    return self.aborted_result(retry_count, retry_contexts, None);
                }
            }
        }
    }

    fn aborted_result(&self, retry_count: u32, retry_contexts: Vec<RetryContext>, attempt: Option<Attempt>) -> AgentRunResult {
        let attempt = attempt.unwrap_or_default();
        self.emitter
            .agent_completed(false, attempt.exit_code, attempt.is_complete, retry_count);
        AgentRunResult {
            exit_code: attempt.exit_code,
            output: attempt.stdout,
            text: attempt.text,
            is_complete: attempt.is_complete,
            error: Some("Aborted".to_string()),
            retry_count,
            aborted: true,
            retry_contexts,
            ..Default::default()
        }
    }

    async fn run_once(&self, id: &str, prompt: &str, abort: &AbortSignal) -> Attempt {
        let settings = &self.settings;
        debug!(%id, command = %settings.command, "AgentRunner::run_once: spawning");

        let mut cmd = Command::new(&settings.command);
        cmd.args(&settings.args)
            .current_dir(&settings.working_dir)
            .stdin(if settings.prompt_via_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !settings.prompt_via_stdin {
            cmd.arg(prompt);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(%id, command = %settings.command, error = %e, "AgentRunner::run_once: spawn failed");
                let exit_code = match e.kind() {
                    std::io::ErrorKind::NotFound => Some(127),
                    std::io::ErrorKind::PermissionDenied => Some(126),
                    _ => None,
                };
                return Attempt {
                    exit_code,
                    spawn_error: Some(format!("Failed to spawn `{}`: {}", settings.command, e)),
                    ..Default::default()
                };
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.set_process(id, pid);
        }

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "AgentRunner: failed to write prompt to stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let mut attempt = Attempt::default();
        let mut stdout_buf = TailBuffer::new(settings.max_output_history_bytes);
        let mut stderr_buf = TailBuffer::new(settings.max_output_history_bytes);
        let mut text_buf = TailBuffer::new(settings.max_output_history_bytes);
        let mut throttle = OutputThrottle::new(settings.output_throttle);

        let mut stdout_done = child.stdout.is_none();
        let mut stderr_done = child.stderr.is_none();
        let mut stdout_lines = child.stdout.take().map(LossyLines::new);
        let mut stderr_lines = child.stderr.take().map(LossyLines::new);

        let started = Instant::now();
        let far_future = started + Duration::from_secs(86_400 * 365);
        let hard_deadline = if settings.timeout.is_zero() { None } else { Some(started + settings.timeout) };
        let stuck_enabled = !settings.stuck_threshold.is_zero();
        let mut stall_check = tokio::time::interval(settings.stall_check_period());
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_output = started;
        let mut drain_deadline: Option<Instant> = None;

        while !(stdout_done && stderr_done) {
            let killed = drain_deadline.is_some();
            tokio::select! {
                line = next_line(&mut stdout_lines), if !stdout_done => match line {
                    Some(line) => {
                        last_output = Instant::now();
                        if line.contains(COMPLETION_SENTINEL) {
                            attempt.is_complete = true;
                        }
                        if let Some(text) = parse_line(&line).text() {
                            text_buf.push_line(text);
                            if let Some(chunk) = throttle.push(text, std::time::Instant::now()) {
                                self.emitter.agent_output(&chunk);
                            }
                        }
                        stdout_buf.push_line(&line);
                    }
                    None => stdout_done = true,
                },
                line = next_line(&mut stderr_lines), if !stderr_done => match line {
                    Some(line) => {
                        last_output = Instant::now();
                        debug!(%id, line = %line, "AgentRunner: stderr");
                        stderr_buf.push_line(&line);
                    }
                    None => stderr_done = true,
                },
                _ = tokio::time::sleep_until(hard_deadline.unwrap_or(far_future)), if hard_deadline.is_some() && !killed => {
                    warn!(%id, timeout_ms = settings.timeout.as_millis() as u64, "AgentRunner: hard timeout, killing agent");
                    attempt.timed_out = true;
                    drain_deadline = Some(self.kill(id));
                }
                _ = stall_check.tick(), if stuck_enabled && !killed => {
                    if last_output.elapsed() >= settings.stuck_threshold {
                        warn!(%id, stuck_ms = settings.stuck_threshold.as_millis() as u64, "AgentRunner: no output, killing agent");
                        attempt.stuck = true;
                        drain_deadline = Some(self.kill(id));
                    }
                }
                _ = abort.cancelled(), if !killed => {
                    info!(%id, "AgentRunner: abort requested, killing agent");
                    attempt.aborted = true;
                    drain_deadline = Some(self.kill(id));
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or(far_future)), if killed => {
                    warn!(%id, "AgentRunner: output did not close after kill");
                    break;
                }
            }
        }

        if let Some(chunk) = throttle.flush() {
            self.emitter.agent_output(&chunk);
        }

        let wait_budget = settings.force_kill_grace + Duration::from_secs(1);
        let status = match tokio::time::timeout(wait_budget, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                warn!(%id, "AgentRunner: agent did not exit, forcing kill");
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        if let Some(pid) = pid {
            self.registry.process_exited(pid);
            if self.registry.pid(id) == Some(pid) {
                self.registry.unregister(id);
            }
        }

        attempt.exit_code = status.and_then(|s| s.code());
        attempt.stdout = stdout_buf.into_string();
        attempt.stderr = stderr_buf.into_string();
        attempt.text = text_buf.into_string();
        debug!(
            %id,
            exit_code = ?attempt.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_complete = attempt.is_complete,
            "AgentRunner::run_once: finished"
        );
        attempt
    }

    /// Kill the process under `id`; returns the deadline for draining its output
    fn kill(&self, id: &str) -> Instant {
        self.registry.kill(id);
        Instant::now() + self.settings.force_kill_grace + Duration::from_secs(1)
    }
}

/// Line reader that decodes invalid UTF-8 lossily instead of failing
///
/// Partial bytes from a cancelled read stay buffered until the line completes.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => Some(self.take_line()),
            Err(e) => {
                warn!(error = %e, "LossyLines::next_line: read failed, closing stream");
                None
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

async fn next_line<R>(lines: &mut Option<LossyLines<R>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

fn attempt_error(attempt: &Attempt, settings: &AgentSettings) -> String {
    if let Some(error) = &attempt.spawn_error {
        return error.clone();
    }
    if attempt.stuck {
        return format!(
            "Agent appears stuck: no output for {}ms",
            settings.stuck_threshold.as_millis()
        );
    }
    if attempt.timed_out {
        return format!("Agent timed out after {}ms", settings.timeout.as_millis());
    }
    let stderr = excerpt(&attempt.stderr, 500);
    match (attempt.exit_code, stderr.is_empty()) {
        (Some(code), true) => format!("Agent exited with code {}", code),
        (Some(code), false) => format!("Agent exited with code {}: {}", code, stderr),
        (None, _) => "Agent terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, script: &str) -> AgentSettings {
        AgentSettings {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            prompt_via_stdin: true,
            working_dir: dir.path().to_path_buf(),
            timeout: Duration::ZERO,
            stuck_threshold: Duration::ZERO,
            max_output_history_bytes: 64 * 1024,
            output_throttle: Duration::ZERO,
            force_kill_grace: Duration::from_millis(200),
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
            retry_with_context: true,
        }
    }

    fn runner(settings: AgentSettings, bus: &EventBus) -> AgentRunner {
        AgentRunner::new(settings, Arc::new(ProcessRegistry::new(Duration::from_millis(200))), bus.emitter_for("main"))
    }

    #[test]
    fn test_backoff_is_exponential() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 64), Duration::MAX);
    }

    proptest! {
        #[test]
        fn prop_backoff_matches_formula(base_ms in 0u64..10_000, retry in 0u32..16) {
            let expected = Duration::from_millis(base_ms * 2u64.pow(retry));
            prop_assert_eq!(backoff_delay(Duration::from_millis(base_ms), retry), expected);
        }
    }

    #[test]
    fn test_tail_buffer_keeps_tail() {
        let mut buf = TailBuffer::new(8);
        buf.push_line("hello");
        buf.push_line("world");
        assert_eq!(buf.into_string(), "o\nworld\n");
    }

    #[tokio::test]
    async fn test_success_without_sentinel() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let runner = runner(settings(&dir, "cat > /dev/null; echo working"), &bus);

        let result = runner.run("main", "prompt").await;
        assert!(result.success);
        assert!(!result.is_complete);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.text.trim(), "working");
    }

    #[tokio::test]
    async fn test_sentinel_in_raw_output() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();
        let script = r#"echo '{"type":"result","result":"all done <promise>COMPLETE</promise>"}'"#;
        let runner = runner(settings(&dir, script), &bus);

        let result = runner.run("main", "p").await;
        assert!(result.success);
        assert!(result.is_complete);

        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(e, Event::AgentOutput { text, .. } if text.contains("all done"))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_reading() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        // Enough output after the bad bytes to fill the pipe if reading stopped
        let script = r#"cat > /dev/null
printf 'bad \377\376 bytes\n'
printf 'err \377\n' >&2
i=0
while [ $i -lt 20000 ]; do echo "line $i"; i=$((i+1)); done
echo '<promise>COMPLETE</promise>'"#;
        let runner = runner(settings(&dir, script), &bus);

        let result = tokio::time::timeout(Duration::from_secs(10), runner.run("main", "p"))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.is_complete);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_lossy_lines_decodes_and_strips_endings() {
        let input: &[u8] = b"ok\r\nbad \xff here\nlast";
        let mut lines = LossyLines::new(input);
        assert_eq!(lines.next_line().await.as_deref(), Some("ok"));
        assert_eq!(lines.next_line().await.as_deref(), Some("bad \u{FFFD} here"));
        assert_eq!(lines.next_line().await.as_deref(), Some("last"));
        assert_eq!(lines.next_line().await, None);
    }

    #[tokio::test]
    async fn test_prompt_reaches_stdin() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let runner = runner(settings(&dir, "cat > prompt.txt"), &bus);
        runner.run("main", "do the thing").await;
        let written = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert_eq!(written, "do the thing");
    }

    #[tokio::test]
    async fn test_fatal_error_no_retries() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();
        let mut s = settings(&dir, "echo 'permission denied: /etc/shadow' >&2; exit 1");
        s.max_retries = 3;
        let runner = runner(s, &bus);

        let result = runner.run("main", "p").await;
        assert!(!result.success);
        assert!(result.is_fatal);
        assert_eq!(result.retry_count, 0);
        assert!(result.suggestion.is_some());
        assert!(!sub.drain().iter().any(|e| e.name() == "agent:retry"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_fatal() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut s = settings(&dir, "");
        s.command = "definitely-not-a-real-agent-binary".to_string();
        s.max_retries = 2;
        let result = runner(s, &bus).run("main", "p").await;
        assert!(result.is_fatal);
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_with_context() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();
        let script = "if [ -f attempted ]; then cat > prompt.txt; echo ok; else touch attempted; echo 'test result: FAILED' ; exit 1; fi";
        let mut s = settings(&dir, script);
        s.max_retries = 2;
        let runner = runner(s, &bus);

        let result = runner.run("main", "base prompt").await;
        assert!(result.success);
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.retry_contexts.len(), 1);
        assert_eq!(result.retry_contexts[0].category, FailureCategory::Test);

        let prompt = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert!(prompt.starts_with("base prompt"));
        assert!(prompt.contains("Previous attempt failed"));

        let retry = sub.drain().into_iter().find(|e| e.name() == "agent:retry").unwrap();
        assert!(matches!(retry, Event::AgentRetry { retry_count: 1, delay_ms: 10, .. }));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut s = settings(&dir, "echo boom >&2; exit 1");
        s.max_retries = 2;
        let result = runner(s, &bus).run("main", "p").await;
        assert!(!result.success);
        assert!(!result.is_fatal);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.retry_contexts.len(), 2);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_stuck_agent_is_killed() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut s = settings(&dir, "echo start; sleep 30");
        s.stuck_threshold = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let result = runner(s, &bus).run("main", "p").await;

        assert!(!result.success);
        assert!(!result.is_fatal);
        assert!(result.error.unwrap().contains("stuck"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_hard_timeout() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let mut s = settings(&dir, "sleep 30");
        s.timeout = Duration::from_millis(300);
        let result = runner(s, &bus).run("main", "p").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_abort_kills_agent() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let runner = runner(settings(&dir, "sleep 30"), &bus);
        let registry = Arc::clone(runner.registry());

        let handle = tokio::spawn(async move { runner.run("main", "p").await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.kill_all();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.aborted);
        assert!(!result.success);
        assert!(!result.is_fatal);
    }

    #[tokio::test]
    async fn test_global_abort_prevents_new_run() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(100);
        let runner = runner(settings(&dir, "touch ran"), &bus);
        runner.registry().kill_all();

        let result = runner.run("main", "p").await;
        assert!(result.aborted);
        assert!(!dir.path().join("ran").exists());
    }
}
