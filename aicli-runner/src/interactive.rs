//! Interactive sessions
//!
//! A long-lived child process driven over stream-JSON stdin/stdout. The
//! session resolves once the CLI announces itself with its
//! `{"type":"system","subtype":"init"}` line; before that point any
//! stderr output, child exit, or spawn error rejects the creation.

use crate::errors::{Result, RunnerError};
use crate::runner::{terminate_child, TERMINATE_GRACE};
use crate::validation::{extract_complete_objects_from_line, sanitize_prompt};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long to wait for the init line
const INIT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for each response object
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);
/// Buffer size for the response channel
const RESPONSE_CHANNEL_SIZE: usize = 100;

/// One live interactive session backed by a child process.
#[derive(Debug)]
pub struct InteractiveSession {
    /// Session id announced by the CLI's init line
    pub session_id: String,
    /// Child process id
    pub pid: Option<u32>,
    child: Child,
    stdin: ChildStdin,
    responses: mpsc::Receiver<Value>,
}

impl InteractiveSession {
    /// Gracefully terminate the child (SIGTERM, then SIGKILL).
    pub async fn terminate(&mut self) -> Result<()> {
        terminate_child(&mut self.child, TERMINATE_GRACE).await
    }
}

/// Spawn an interactive session in `working_dir` and wait for its init
/// announcement.
///
/// Rejects when stderr produces non-empty output, when the child exits,
/// or when the spawn itself errors before init arrives.
pub async fn create_interactive_session(
    command: &str,
    working_dir: &Path,
) -> Result<InteractiveSession> {
    let mut cmd = Command::new(command);
    cmd.arg("--output-format")
        .arg("stream-json")
        .arg("--input-format")
        .arg("stream-json")
        .arg("--verbose")
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(command, working_dir = %working_dir.display(), "Starting interactive AICLI session");

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            RunnerError::CliNotFound {
                searched: command.to_string(),
            }
        } else {
            RunnerError::ProcessError(e)
        }
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RunnerError::invalid_state("child stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::invalid_state("child stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::invalid_state("child stderr unavailable"))?;

    let (line_tx, mut line_rx) = mpsc::channel::<Value>(RESPONSE_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let objects = match serde_json::from_str::<Value>(&line) {
                Ok(value) => vec![value],
                Err(_) => extract_complete_objects_from_line(&line),
            };
            for object in objects {
                if line_tx.send(object).await.is_err() {
                    return;
                }
            }
        }
        debug!("Interactive stdout stream ended");
    });

    let (err_tx, mut err_rx) = mpsc::channel::<String>(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            warn!("Interactive AICLI stderr: {}", line);
            if err_tx.send(line).await.is_err() {
                return;
            }
        }
    });

    let init = tokio::time::timeout(INIT_TIMEOUT, wait_for_init(&mut line_rx, &mut err_rx)).await;

    match init {
        Ok(Ok(session_id)) => {
            info!(session_id = %session_id, "Interactive session initialized");
            Ok(InteractiveSession {
                session_id,
                pid: child.id(),
                child,
                stdin,
                responses: line_rx,
            })
        }
        Ok(Err(e)) => {
            let _ = terminate_child(&mut child, TERMINATE_GRACE).await;
            Err(e)
        }
        Err(_) => {
            let _ = terminate_child(&mut child, TERMINATE_GRACE).await;
            Err(RunnerError::timeout(INIT_TIMEOUT.as_secs()))
        }
    }
}

/// Wait for the CLI's init announcement, watching stderr and exit.
async fn wait_for_init(
    line_rx: &mut mpsc::Receiver<Value>,
    err_rx: &mut mpsc::Receiver<String>,
) -> Result<String> {
    let mut stderr_done = false;
    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(value) => {
                    let is_init = value.get("type").and_then(|v| v.as_str()) == Some("system")
                        && value.get("subtype").and_then(|v| v.as_str()) == Some("init");
                    if is_init {
                        if let Some(session_id) = value.get("session_id").and_then(|v| v.as_str()) {
                            return Ok(session_id.to_string());
                        }
                        return Err(RunnerError::SessionInitFailed(
                            "init line missing session_id".to_string(),
                        ));
                    }
                    debug!("Pre-init output ignored: {}", value);
                }
                None => {
                    return Err(RunnerError::SessionInitFailed(
                        "process exited before init".to_string(),
                    ))
                }
            },
            err = err_rx.recv(), if !stderr_done => match err {
                Some(line) => return Err(RunnerError::SessionInitFailed(line)),
                None => stderr_done = true,
            },
        }
    }
}

/// Write one request into a session and collect responses until a
/// `result` object or a fatal stream error arrives.
pub async fn send_to_interactive_session(
    session: &mut InteractiveSession,
    text: &str,
) -> Result<Vec<Value>> {
    let text = sanitize_prompt(text)?;
    let request = serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
        "session_id": session.session_id,
    });
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    session.stdin.write_all(line.as_bytes()).await?;
    session.stdin.flush().await?;

    let mut collected = Vec::new();
    loop {
        let next = tokio::time::timeout(RESPONSE_TIMEOUT, session.responses.recv()).await;
        match next {
            Ok(Some(value)) => {
                let value_type = value
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if value_type == "error" {
                    let message = value
                        .get("error")
                        .or_else(|| value.get("message"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown stream error")
                        .to_string();
                    return Err(RunnerError::StreamFailure(message));
                }
                let is_result = value_type == "result" || value.get("result").is_some();
                collected.push(value);
                if is_result {
                    return Ok(collected);
                }
            }
            Ok(None) => return Err(RunnerError::ChannelClosed),
            Err(_) => return Err(RunnerError::timeout(RESPONSE_TIMEOUT.as_secs())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    fn fake_cli(script_body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-aicli");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{}", script_body).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path_str = path.to_string_lossy().to_string();
        (dir, path_str)
    }

    #[tokio::test]
    async fn test_create_resolves_on_init() {
        let (dir, cli) = fake_cli(concat!(
            "printf '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess_1\"}\\n'\n",
            "read _ignored",
        ));
        let mut session = create_interactive_session(&cli, dir.path()).await.unwrap();
        assert_eq!(session.session_id, "sess_1");
        assert!(session.pid.is_some());
        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_on_stderr() {
        let (dir, cli) = fake_cli("echo 'spawn failure' >&2\nsleep 2");
        let err = create_interactive_session(&cli, dir.path())
            .await
            .unwrap_err();
        match err {
            RunnerError::SessionInitFailed(msg) => assert!(msg.contains("spawn failure")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_on_early_exit() {
        let (dir, cli) = fake_cli("exit 0");
        let err = create_interactive_session(&cli, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SessionInitFailed(_)));
    }

    #[tokio::test]
    async fn test_send_collects_until_result() {
        let (dir, cli) = fake_cli(concat!(
            "printf '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess_2\"}\\n'\n",
            "read _request\n",
            "printf '{\"type\":\"assistant\",\"message\":{\"content\":[]},\"session_id\":\"sess_2\"}\\n'\n",
            "printf '{\"type\":\"result\",\"result\":\"done\",\"session_id\":\"sess_2\"}\\n'",
        ));
        let mut session = create_interactive_session(&cli, dir.path()).await.unwrap();
        let responses = send_to_interactive_session(&mut session, "do a thing")
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1]["result"], "done");
    }
}
