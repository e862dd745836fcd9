//! Session catalog
//!
//! One record per live conversation: its working directory, lifecycle
//! flags, and (for interactive sessions) the supervised child handle.
//! Killing a session tears its child down SIGTERM-first.

use aicli_runner::InteractiveSession;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// Snapshot of one session's metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub conversation_started: bool,
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct SessionRecord {
    info: SessionInfo,
    interactive: Option<Arc<AsyncMutex<InteractiveSession>>>,
}

/// Catalog of live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Look a session up, creating it with the given working directory
    /// when absent.
    pub fn ensure(&self, session_id: &str, working_dir: Option<PathBuf>) -> SessionInfo {
        let mut sessions = self.sessions.write();
        let record = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let now = Utc::now();
            SessionRecord {
                info: SessionInfo {
                    session_id: session_id.to_string(),
                    working_dir: working_dir
                        .or_else(|| std::env::current_dir().ok())
                        .unwrap_or_else(|| PathBuf::from(".")),
                    conversation_started: false,
                    restored: false,
                    initial_prompt: None,
                    created_at: now,
                    updated_at: now,
                    pid: None,
                },
                interactive: None,
            }
        });
        record.info.clone()
    }

    /// Re-create a session known from a previous gateway run.
    pub fn restore(&self, session_id: &str, working_dir: PathBuf) -> SessionInfo {
        let now = Utc::now();
        let info = SessionInfo {
            session_id: session_id.to_string(),
            working_dir,
            conversation_started: true,
            restored: true,
            initial_prompt: None,
            created_at: now,
            updated_at: now,
            pid: None,
        };
        self.sessions.write().insert(
            session_id.to_string(),
            SessionRecord {
                info: info.clone(),
                interactive: None,
            },
        );
        info
    }

    /// Record the first prompt of a conversation.
    pub fn mark_conversation_started(&self, session_id: &str, initial_prompt: Option<&str>) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            if !record.info.conversation_started {
                record.info.conversation_started = true;
                record.info.initial_prompt = initial_prompt.map(str::to_string);
            }
            record.info.updated_at = Utc::now();
        }
    }

    /// Attach a spawned interactive child to its session.
    pub fn attach_interactive(&self, session_id: &str, interactive: InteractiveSession) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.info.pid = interactive.pid;
            record.info.updated_at = Utc::now();
            record.interactive = Some(Arc::new(AsyncMutex::new(interactive)));
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).map(|r| r.info.clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(|r| r.info.clone()).collect()
    }

    /// Interactive handle for a session, if one is attached.
    pub fn interactive_handle(&self, session_id: &str) -> Option<Arc<AsyncMutex<InteractiveSession>>> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|r| r.interactive.clone())
    }

    /// Kill a session: terminate its child (SIGTERM, then SIGKILL) and
    /// drop the record. Returns `false` for unknown sessions.
    pub async fn kill(&self, session_id: &str) -> bool {
        let record = self.sessions.write().remove(session_id);
        let Some(record) = record else {
            return false;
        };
        if let Some(interactive) = record.interactive {
            let mut guard = interactive.lock().await;
            let _ = guard.terminate().await;
        }
        info!(session_id, "Session killed");
        true
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}
