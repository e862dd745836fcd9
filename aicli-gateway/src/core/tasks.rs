//! Long-running task manager
//!
//! Prompts whose estimated runtime crosses the long-task threshold are
//! acknowledged immediately and executed in the background: clients get
//! a processing notice, a heartbeat while the work runs, and a final
//! message plus a push notification when it completes or fails.

use crate::core::push::PushNotifier;
use aicli_runner::StreamEvent;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Estimates how long a prompt will take to execute.
pub trait TimeoutEstimator: Send + Sync {
    fn estimate_ms(&self, prompt: &str) -> u64;
}

/// Keyword/length heuristic used in production.
pub struct HeuristicEstimator;

const HEAVY_KEYWORDS: [&str; 7] = [
    "refactor",
    "migrate",
    "analyze",
    "rewrite",
    "entire",
    "comprehensive",
    "all files",
];

impl TimeoutEstimator for HeuristicEstimator {
    fn estimate_ms(&self, prompt: &str) -> u64 {
        let mut estimate: u64 = 60_000;
        let lower = prompt.to_lowercase();
        for keyword in HEAVY_KEYWORDS {
            if lower.contains(keyword) {
                estimate += 120_000;
            }
        }
        estimate += (prompt.chars().count() as u64 / 500) * 30_000;
        estimate.min(1_800_000)
    }
}

/// Fixed estimate, injected by tests.
pub struct FixedEstimator(pub u64);

impl TimeoutEstimator for FixedEstimator {
    fn estimate_ms(&self, _prompt: &str) -> u64 {
        self.0
    }
}

/// Task manager tunables.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Estimates above this are handled as long-running
    pub long_threshold_ms: u64,
    /// Heartbeat period while a long task runs
    pub heartbeat: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            long_threshold_ms: 300_000,
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Immediate acknowledgement returned for a long-running prompt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LongRunningAck {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub subtype: &'static str,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: &'static str,
    pub estimated_duration_ms: u64,
}

/// What `handle` produced: a completed short task, or an immediate
/// acknowledgement for a backgrounded long one.
pub enum TaskHandle {
    Completed(anyhow::Result<Value>),
    LongRunning(LongRunningAck),
}

/// Wraps runner invocations with long-task detection, heartbeat, and
/// completion notification.
pub struct LongRunningTaskManager {
    config: TaskManagerConfig,
    estimator: Arc<dyn TimeoutEstimator>,
    events_tx: broadcast::Sender<StreamEvent>,
    notifier: Arc<PushNotifier>,
}

impl LongRunningTaskManager {
    pub fn new(
        config: TaskManagerConfig,
        estimator: Arc<dyn TimeoutEstimator>,
        events_tx: broadcast::Sender<StreamEvent>,
        notifier: Arc<PushNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            estimator,
            events_tx,
            notifier,
        })
    }

    /// Execute a prompt, awaiting short tasks inline and backgrounding
    /// long ones behind an immediate status acknowledgement.
    pub async fn handle<F>(&self, session_id: &str, prompt: &str, execute: F) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let estimate_ms = self.estimator.estimate_ms(prompt);
        if estimate_ms <= self.config.long_threshold_ms {
            return TaskHandle::Completed(execute.await);
        }

        info!(
            session_id,
            estimate_ms, "Handling prompt as long-running task"
        );
        let _ = self.events_tx.send(StreamEvent::assistant_text(
            session_id,
            "Processing Complex Request: this may take several minutes.",
            false,
        ));

        self.spawn_background(session_id.to_string(), execute);

        TaskHandle::LongRunning(LongRunningAck {
            kind: "status",
            subtype: "long_running_started",
            session_id: session_id.to_string(),
            status: "processing",
            estimated_duration_ms: estimate_ms,
        })
    }

    fn spawn_background<F>(&self, session_id: String, execute: F)
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let events = self.events_tx.clone();
        let notifier = Arc::clone(&self.notifier);
        let heartbeat = self.config.heartbeat;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.tick().await;
            tokio::pin!(execute);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = events.send(StreamEvent::assistant_text(
                            &session_id,
                            "Still working…",
                            false,
                        ));
                    }
                    result = &mut execute => {
                        match result {
                            Ok(value) => {
                                let text = result_text(&value);
                                let _ = events.send(StreamEvent::assistant_text(
                                    &session_id,
                                    &text,
                                    true,
                                ));
                                notifier
                                    .send_response_notification(&session_id, &text, true)
                                    .await;
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, "Long-running task failed: {e}");
                                let text = format!("Complex Request Failed: {e}");
                                let _ = events.send(StreamEvent::assistant_text(
                                    &session_id,
                                    &text,
                                    true,
                                ));
                                let _ = events.send(StreamEvent::StreamError {
                                    session_id: session_id.clone(),
                                    error: e.to_string(),
                                });
                                notifier.send_error_notification(&session_id, &text).await;
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Estimated completion time in minutes, rounded up.
    pub fn get_estimated_completion_minutes(&self, prompt: &str) -> u64 {
        let ms = self.estimator.estimate_ms(prompt);
        ms.div_ceil(60_000)
    }
}

/// Text carried by a final result value: the `result` field when it is a
/// string, otherwise the whole value rendered as JSON.
fn result_text(value: &Value) -> String {
    match value.get("result") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Human-readable project name derived from a session id: underscore
/// tokens with a trailing UUID-looking token dropped.
pub fn project_name_from_session_id(session_id: &str) -> String {
    let parts: Vec<&str> = session_id.split('_').collect();
    if parts.len() > 1 && looks_like_uuid(parts[parts.len() - 1]) {
        return parts[..parts.len() - 1].join("_");
    }
    session_id.to_string()
}

fn looks_like_uuid(token: &str) -> bool {
    let hyphenated = token.len() == 36
        && token.split('-').map(|g| g.len()).collect::<Vec<_>>() == [8, 4, 4, 4, 12]
        && token.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    let bare = token.len() == 32 && token.chars().all(|c| c.is_ascii_hexdigit());
    hyphenated || bare
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::core::push::test_support::FakePushTransport;
    use serde_json::json;

    const EVENT_WAIT: Duration = Duration::from_secs(2);

    fn manager(
        estimate_ms: u64,
        heartbeat: Duration,
    ) -> (
        Arc<LongRunningTaskManager>,
        broadcast::Receiver<StreamEvent>,
        Arc<FakePushTransport>,
    ) {
        let (events_tx, events_rx) = broadcast::channel(64);
        let transport = FakePushTransport::new();
        let notifier = PushNotifier::new(transport.clone(), 3, 10, EventBus::new());
        notifier.register_token("c1", "tok1");
        let manager = LongRunningTaskManager::new(
            TaskManagerConfig {
                long_threshold_ms: 300_000,
                heartbeat,
            },
            Arc::new(FixedEstimator(estimate_ms)),
            events_tx,
            notifier,
        );
        (manager, events_rx, transport)
    }

    async fn next_assistant_text(
        rx: &mut broadcast::Receiver<StreamEvent>,
    ) -> (String, bool) {
        loop {
            let event = tokio::time::timeout(EVENT_WAIT, rx.recv())
                .await
                .expect("timed out waiting for event")
                .unwrap();
            if let StreamEvent::AssistantMessage { is_complete, .. } = &event {
                let text = event.assistant_text_content().unwrap().to_string();
                return (text, *is_complete);
            }
        }
    }

    #[tokio::test]
    async fn test_short_task_awaited_inline() {
        let (manager, _rx, transport) = manager(1_000, Duration::from_secs(30));
        let handle = manager
            .handle("s", "quick", async { Ok(json!({"result": "fast"})) })
            .await;
        match handle {
            TaskHandle::Completed(result) => {
                assert_eq!(result.unwrap()["result"], "fast");
            }
            TaskHandle::LongRunning(_) => panic!("short task must complete inline"),
        }
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_long_task_acknowledged_and_completed() {
        let (manager, mut rx, transport) = manager(400_000, Duration::from_secs(30));
        let handle = manager
            .handle("s", "Complex prompt", async {
                Ok(json!({"type": "result", "result": "ok"}))
            })
            .await;

        let ack = match handle {
            TaskHandle::LongRunning(ack) => ack,
            TaskHandle::Completed(_) => panic!("long task must return an ack"),
        };
        assert_eq!(ack.kind, "status");
        assert_eq!(ack.subtype, "long_running_started");
        assert_eq!(ack.session_id, "s");
        assert_eq!(ack.status, "processing");
        assert_eq!(ack.estimated_duration_ms, 400_000);

        let (first, complete) = next_assistant_text(&mut rx).await;
        assert!(first.contains("Processing Complex Request"));
        assert!(!complete);

        let (last, complete) = next_assistant_text(&mut rx).await;
        assert_eq!(last, "ok");
        assert!(complete);

        // Exactly one completion push.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_long_task_failure_emits_stream_error() {
        let (manager, mut rx, transport) = manager(400_000, Duration::from_secs(30));
        manager
            .handle("s", "Complex prompt", async {
                Err(anyhow::anyhow!("backend exploded"))
            })
            .await;

        let (_processing, _) = next_assistant_text(&mut rx).await;
        let (failure, complete) = next_assistant_text(&mut rx).await;
        assert!(failure.starts_with("Complex Request Failed:"));
        assert!(complete);

        let mut saw_stream_error = false;
        let deadline = tokio::time::Instant::now() + EVENT_WAIT;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(StreamEvent::StreamError { error, .. })) => {
                    assert_eq!(error, "backend exploded");
                    saw_stream_error = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_stream_error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_while_running() {
        let (manager, mut rx, _transport) = manager(400_000, Duration::from_millis(10));
        manager
            .handle("s", "Complex prompt", async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(json!({"result": "late"}))
            })
            .await;

        let (_processing, _) = next_assistant_text(&mut rx).await;
        let mut heartbeats = 0;
        loop {
            let (text, complete) = next_assistant_text(&mut rx).await;
            if complete {
                assert_eq!(text, "late");
                break;
            }
            assert_eq!(text, "Still working…");
            heartbeats += 1;
        }
        assert!(heartbeats >= 1);
    }

    #[test]
    fn test_estimated_completion_minutes_rounds_up() {
        let (events_tx, _) = broadcast::channel(8);
        let notifier = PushNotifier::new(FakePushTransport::new(), 3, 10, EventBus::new());
        let manager = LongRunningTaskManager::new(
            TaskManagerConfig::default(),
            Arc::new(FixedEstimator(400_000)),
            events_tx,
            notifier,
        );
        assert_eq!(manager.get_estimated_completion_minutes("x"), 7);
    }

    #[test]
    fn test_project_name_derivation() {
        assert_eq!(
            project_name_from_session_id(
                "my_project_550e8400-e29b-41d4-a716-446655440000"
            ),
            "my_project"
        );
        assert_eq!(
            project_name_from_session_id("api_server_0123456789abcdef0123456789abcdef"),
            "api_server"
        );
        assert_eq!(project_name_from_session_id("plain_name"), "plain_name");
        assert_eq!(
            project_name_from_session_id("550e8400-e29b-41d4-a716-446655440000"),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn test_heuristic_estimator_scales_with_keywords() {
        let estimator = HeuristicEstimator;
        let short = estimator.estimate_ms("hi");
        let heavy = estimator.estimate_ms("refactor the entire codebase comprehensively");
        assert!(heavy > short);
    }
}
