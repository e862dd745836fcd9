//! AI process runner
//!
//! Spawns the AICLI binary as a child process, feeds it the prompt over
//! stdin, consumes its stdout as stream-JSON, emits typed events on a
//! broadcast bus, and returns a final aggregate value once the child
//! exits.

use crate::errors::{Result, RunnerError};
use crate::health::{HealthMonitor, HEARTBEAT_PERIOD};
use crate::stream_parser::StreamParser;
use crate::types::{RunnerOptions, StreamEvent};
use crate::validation::{extract_final_result, parse_stream_json_output, sanitize_prompt};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::io::ErrorKind;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Candidate binary names, probed in order.
pub const CLI_CANDIDATES: [&str; 2] = ["claude", "aicli"];

/// Broadcast buffer for runner events
const EVENT_CHANNEL_SIZE: usize = 256;

/// Number of stderr lines kept in failure reports
const STDERR_TAIL_LINES: usize = 10;

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// True when running under the test environment flag.
///
/// Background intervals (heartbeats, probes) are suppressed so tests
/// observe deterministic state.
pub fn is_test_environment() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("RUN_MODE").ok().as_deref(),
        Some("test")
    ) || matches!(std::env::var("NODE_ENV").ok().as_deref(), Some("test"))
}

/// Discover the CLI command name.
///
/// In a test environment this always returns the literal `claude`.
/// Otherwise each candidate is probed with a `--version` invocation and
/// the first success wins, falling back to `claude`.
pub async fn discover_cli_command() -> String {
    if is_test_environment() {
        return "claude".to_string();
    }
    for candidate in CLI_CANDIDATES {
        if let Some(path) = locate_candidate(candidate) {
            if probe_version(&path).await {
                debug!("Discovered AICLI binary: {}", path.display());
                return path.to_string_lossy().to_string();
            }
        }
    }
    warn!("No AICLI candidate answered --version, falling back to claude");
    "claude".to_string()
}

/// Find a candidate binary on PATH or in common install locations.
fn locate_candidate(candidate: &str) -> Option<std::path::PathBuf> {
    if let Ok(path) = which::which(candidate) {
        return Some(path);
    }
    let home = dirs::home_dir()?;
    let locations = [
        home.join(".local/bin").join(candidate),
        home.join(".npm-global/bin").join(candidate),
        std::path::PathBuf::from("/usr/local/bin").join(candidate),
        std::path::PathBuf::from("/opt/homebrew/bin").join(candidate),
    ];
    locations.into_iter().find(|p| p.is_file())
}

/// Probe a binary by running `--version` with a timeout.
async fn probe_version(path: &std::path::Path) -> bool {
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new(path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    matches!(status, Ok(Ok(s)) if s.success())
}

/// Terminate a child gracefully: SIGTERM first, SIGKILL after the grace
/// period expires.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                return Ok(());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    child.kill().await?;
    Ok(())
}

/// Runner for one-shot prompt executions against the AICLI binary.
pub struct AiCliRunner {
    command: String,
    events_tx: broadcast::Sender<StreamEvent>,
}

impl AiCliRunner {
    /// Create a runner for an explicit command name.
    pub fn new(command: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            command: command.into(),
            events_tx,
        }
    }

    /// Create a runner with a discovered command name.
    pub async fn discover() -> Self {
        Self::new(discover_cli_command().await)
    }

    /// The CLI command this runner spawns.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Subscribe to the runner's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe as a `Stream`, dropping lagged windows with a warning.
    pub fn subscribe_stream(&self) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>> {
        let rx = self.events_tx.subscribe();
        Box::pin(
            tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|result| async move {
                match result {
                    Ok(event) => Some(event),
                    Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                        warn!("Event receiver lagged by {} events", n);
                        None
                    }
                }
            }),
        )
    }

    /// Sender half of the event bus, for components that emit alongside
    /// the runner (task manager progress messages).
    pub fn events_sender(&self) -> broadcast::Sender<StreamEvent> {
        self.events_tx.clone()
    }

    fn emit(&self, event: StreamEvent) {
        // Broadcast send only fails when no receiver is subscribed.
        let _ = self.events_tx.send(event);
    }

    /// Assemble the argument list for one invocation.
    ///
    /// Permission flags: `--permission-mode`, `--allowedTools`,
    /// `--disallowedTools` — all suppressed in favor of
    /// `--dangerously-skip-permissions` when `skip_permissions` is set.
    pub fn build_args(options: &RunnerOptions) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        let permissions = &options.permissions;
        if permissions.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--permission-mode".to_string());
            args.push(permissions.mode.as_flag_value().to_string());
            if !permissions.allowed_tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.push(permissions.allowed_tools.join(","));
            }
            if !permissions.disallowed_tools.is_empty() {
                args.push("--disallowedTools".to_string());
                args.push(permissions.disallowed_tools.join(","));
            }
        }
        args
    }

    /// Run one prompt to completion and return the final aggregate.
    ///
    /// Emits `processStart`, the parsed stream events, `processStderr`
    /// lines, and `processExit`. The health monitor is released on every
    /// exit path.
    pub async fn run(
        &self,
        session_id: &str,
        prompt: &str,
        options: &RunnerOptions,
    ) -> Result<Value> {
        let prompt = sanitize_prompt(prompt)?;
        let args = Self::build_args(options);

        let mut cmd = Command::new(&self.command);
        cmd.args(&args);
        if let Some(ref dir) = options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(session_id, command = %self.command, "Starting AICLI process");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RunnerError::CliNotFound {
                    searched: self.command.clone(),
                }
            } else {
                RunnerError::ProcessError(e)
            }
        })?;

        let monitor = HealthMonitor::new(session_id);
        if !is_test_environment() {
            monitor.start_heartbeat(HEARTBEAT_PERIOD);
        }

        self.emit(StreamEvent::ProcessStart {
            session_id: session_id.to_string(),
            pid: child.id(),
        });

        let result = self
            .drive_child(&mut child, session_id, &prompt, &args, options, &monitor)
            .await;

        monitor.cleanup();
        result
    }

    async fn drive_child(
        &self,
        child: &mut Child,
        session_id: &str,
        prompt: &str,
        args: &[String],
        options: &RunnerOptions,
        monitor: &HealthMonitor,
    ) -> Result<Value> {
        // Prompt delivery: with --print the prompt goes to stdin and the
        // pipe is closed; otherwise the prompt is already encoded in a
        // flag and stdin is closed untouched.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::invalid_state("child stdin unavailable"))?;
        if args.iter().any(|a| a == "--print") {
            let mut stdin = stdin;
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.flush().await?;
        }
        // stdin dropped here, closing the pipe

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::invalid_state("child stderr unavailable"))?;
        let stderr_tx = self.events_tx.clone();
        let stderr_session = session_id.to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(session_id = %stderr_session, "AICLI stderr: {}", line);
                let _ = stderr_tx.send(StreamEvent::ProcessStderr {
                    session_id: stderr_session.clone(),
                    line: line.clone(),
                });
                collected.push(line);
            }
            collected
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::invalid_state("child stdout unavailable"))?;
        // Every run carries a request id so events stay correlatable.
        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut parser = StreamParser::new(session_id, Some(request_id));
        let mut captured = String::new();
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            monitor.record_activity();
            captured.push_str(&line);
            for event in parser.push_text(&line) {
                self.emit(event);
            }
        }
        for event in parser.flush() {
            self.emit(event);
        }

        let status = child.wait().await?;
        let stderr_lines = stderr_task.await.unwrap_or_default();

        self.emit(StreamEvent::ProcessExit {
            session_id: session_id.to_string(),
            code: status.code(),
        });

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(RunnerError::ProcessExited {
                code,
                stderr_tail: stderr_tail(&stderr_lines),
            });
        }

        finalize_output(&captured)
    }

    /// Parse a complete captured stdout blob into a final aggregate.
    pub fn process_output(&self, output: &str) -> Result<Value> {
        finalize_output(output)
    }
}

/// Last lines of collected stderr, for failure reports.
fn stderr_tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Final-result extraction over a complete stdout capture.
///
/// Empty output, unrecoverable output, and mid-value truncation each fail
/// with their own reason so callers can surface it verbatim.
fn finalize_output(output: &str) -> Result<Value> {
    if output.trim().is_empty() {
        return Err(RunnerError::EmptyOutput);
    }

    let objects = parse_stream_json_output(output);
    if objects.is_empty() {
        let mut last_error: Option<String> = None;
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = serde_json::from_str::<Value>(line) {
                last_error = Some(e.to_string());
            }
        }
        if let Some(detail) = last_error {
            if detail.contains("EOF while parsing a string") {
                return Err(RunnerError::TruncatedOutput { detail });
            }
            if detail.contains("EOF while parsing") {
                return Err(RunnerError::UnexpectedEnd { detail });
            }
        }
        return Err(RunnerError::NoValidJson);
    }

    extract_final_result(&objects).ok_or(RunnerError::NoValidJson)
}
