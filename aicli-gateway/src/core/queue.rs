//! Per-session message queue with TTL and delivery tracking
//!
//! Messages addressed to a session are buffered here so clients that are
//! disconnected when an event fires still receive it on reconnect. Each
//! entry tracks which client ids it has reached; once every tracked
//! client has it, the entry is dropped. Nothing survives past its TTL.

use crate::core::events::EventBus;
use aicli_runner::validation::validate_stream_chunk;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default message TTL: 24 hours
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Delivery priority. HIGH entries surface before NORMAL, NORMAL before
/// LOW; insertion order is preserved within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options for one enqueue call.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Override the queue's default TTL
    pub ttl: Option<Duration>,
    /// Delivery priority
    pub priority: Priority,
}

/// One buffered message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: String,
    pub message: Value,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub delivered_to: HashSet<String>,
    pub acknowledged_by: HashSet<String>,
    pub fully_delivered: bool,
}

impl QueuedMessage {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
struct SessionQueue {
    entries: Vec<QueuedMessage>,
    tracked_clients: HashSet<String>,
}

/// TTL-bounded per-session message buffer with per-client delivery
/// tracking.
pub struct MessageQueue {
    sessions: RwLock<HashMap<String, SessionQueue>>,
    default_ttl: ChronoDuration,
    #[allow(dead_code)]
    bus: EventBus,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    pub fn new(default_ttl_hours: i64, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            default_ttl: ChronoDuration::hours(default_ttl_hours),
            bus,
            cleanup_task: Mutex::new(None),
        })
    }

    /// Buffer a message for a session.
    ///
    /// Returns the minted message id, or `None` for rejected input:
    /// non-object messages and `streamChunk` messages whose inner chunk
    /// is empty or absent. Accepted messages are enriched with `_queued`,
    /// `_queuedAt`, and `_originalTimestamp` markers.
    pub fn queue(
        &self,
        session_id: &str,
        message: Value,
        options: QueueOptions,
    ) -> Option<String> {
        let Some(obj) = message.as_object() else {
            warn!(session_id, "Rejecting non-object message");
            return None;
        };

        if obj.get("type").and_then(|v| v.as_str()) == Some("streamChunk") {
            let chunk = obj
                .get("data")
                .and_then(|d| d.get("chunk"))
                .or_else(|| obj.get("chunk"));
            match chunk {
                Some(chunk) if validate_stream_chunk(chunk) => {}
                _ => {
                    debug!(session_id, "Rejecting empty stream chunk");
                    return None;
                }
            }
        }

        let now = Utc::now();
        let ttl = options
            .ttl
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .unwrap_or(self.default_ttl);

        let mut enriched = message;
        let original_timestamp = enriched.get("timestamp").cloned();
        if let Some(map) = enriched.as_object_mut() {
            map.insert("_queued".to_string(), Value::Bool(true));
            map.insert("_queuedAt".to_string(), Value::String(now.to_rfc3339()));
            if let Some(original) = original_timestamp {
                map.insert("_originalTimestamp".to_string(), original);
            }
        }

        let id = Uuid::new_v4().to_string();
        let entry = QueuedMessage {
            id: id.clone(),
            session_id: session_id.to_string(),
            message: enriched,
            priority: options.priority,
            enqueued_at: now,
            expires_at: now + ttl,
            delivered_to: HashSet::new(),
            acknowledged_by: HashSet::new(),
            fully_delivered: false,
        };

        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .entries
            .push(entry);
        Some(id)
    }

    /// Register a client in the session's tracked set. Idempotent; the
    /// tracked set defines what "fully delivered" means.
    pub fn track_client(&self, session_id: &str, client_id: &str) {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .tracked_clients
            .insert(client_id.to_string());
    }

    /// Unexpired entries a client has not received yet, HIGH priority
    /// first, insertion order within a band.
    pub fn get_undelivered(&self, session_id: &str, client_id: &str) -> Vec<QueuedMessage> {
        let now = Utc::now();
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut pending: Vec<QueuedMessage> = session
            .entries
            .iter()
            .filter(|e| {
                !e.fully_delivered && !e.is_expired(now) && !e.delivered_to.contains(client_id)
            })
            .cloned()
            .collect();
        // Stable sort keeps insertion order within each priority band.
        pending.sort_by(|a, b| b.priority.cmp(&a.priority));
        pending
    }

    /// Record that a client received the given messages. An entry that
    /// has reached every tracked client is removed.
    pub fn mark_delivered(&self, message_ids: &[String], client_id: &str) {
        let mut sessions = self.sessions.write();
        for session in sessions.values_mut() {
            for entry in session.entries.iter_mut() {
                if message_ids.contains(&entry.id) {
                    entry.delivered_to.insert(client_id.to_string());
                    if !session.tracked_clients.is_empty()
                        && session
                            .tracked_clients
                            .iter()
                            .all(|c| entry.delivered_to.contains(c))
                    {
                        entry.fully_delivered = true;
                    }
                }
            }
            session.entries.retain(|e| !e.fully_delivered);
        }
    }

    /// Record a client-side acknowledgement.
    pub fn acknowledge(&self, message_id: &str, client_id: &str) {
        let mut sessions = self.sessions.write();
        for session in sessions.values_mut() {
            for entry in session.entries.iter_mut() {
                if entry.id == message_id {
                    entry.acknowledged_by.insert(client_id.to_string());
                }
            }
        }
    }

    /// Drain a client's backlog through `send`, marking each entry
    /// delivered. Returns the delivered message ids.
    pub fn deliver<F>(&self, session_id: &str, client_id: &str, mut send: F) -> Vec<String>
    where
        F: FnMut(&Value),
    {
        let pending = self.get_undelivered(session_id, client_id);
        let mut delivered = Vec::with_capacity(pending.len());
        for entry in &pending {
            send(&entry.message);
            delivered.push(entry.id.clone());
        }
        if !delivered.is_empty() {
            self.mark_delivered(&delivered, client_id);
        }
        delivered
    }

    /// Drop expired entries and empty sessions (tracked-client sets
    /// included). Returns how many entries were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut dropped = 0;
        let mut sessions = self.sessions.write();
        sessions.retain(|session_id, session| {
            let before = session.entries.len();
            session.entries.retain(|e| !e.is_expired(now));
            dropped += before - session.entries.len();
            if session.entries.is_empty() {
                debug!(session_id, "Dropping empty session queue");
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Whether any unexpired, not-fully-delivered entry remains.
    pub fn has_queued(&self, session_id: &str) -> bool {
        let now = Utc::now();
        self.sessions
            .read()
            .get(session_id)
            .map(|s| {
                s.entries
                    .iter()
                    .any(|e| !e.fully_delivered && !e.is_expired(now))
            })
            .unwrap_or(false)
    }

    /// Number of buffered entries for a session.
    pub fn queued_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Start the hourly cleanup timer. Never called in test runs; a
    /// second start is a no-op.
    pub fn start_cleanup_timer(self: &Arc<Self>, period: Duration) {
        let mut guard = self.cleanup_task.lock();
        if guard.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let dropped = queue.cleanup_expired();
                if dropped > 0 {
                    debug!(dropped, "Expired queue entries removed");
                }
            }
        }));
    }

    /// Stop the cleanup timer.
    pub fn stop_cleanup_timer(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }

    /// Whether the cleanup timer is running.
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> Arc<MessageQueue> {
        MessageQueue::new(DEFAULT_TTL_HOURS, EventBus::new())
    }

    #[test]
    fn test_queue_rejects_non_objects() {
        let q = queue();
        assert!(q.queue("s", json!("text"), QueueOptions::default()).is_none());
        assert!(q.queue("s", json!(42), QueueOptions::default()).is_none());
    }

    #[test]
    fn test_queue_rejects_empty_stream_chunks() {
        let q = queue();
        let empty = json!({
            "type": "streamChunk",
            "data": { "chunk": { "type": "content", "data": "  " } }
        });
        assert!(q.queue("s", empty, QueueOptions::default()).is_none());

        let missing = json!({ "type": "streamChunk", "data": {} });
        assert!(q.queue("s", missing, QueueOptions::default()).is_none());

        let valid = json!({
            "type": "streamChunk",
            "data": { "chunk": { "type": "content", "data": "hello" } }
        });
        assert!(q.queue("s", valid, QueueOptions::default()).is_some());
    }

    #[test]
    fn test_queue_enriches_messages() {
        let q = queue();
        q.track_client("s", "c1");
        let id = q
            .queue(
                "s",
                json!({"type": "assistantMessage", "timestamp": "t0"}),
                QueueOptions::default(),
            )
            .unwrap();
        let pending = q.get_undelivered("s", "c1");
        assert_eq!(pending[0].id, id);
        let message = &pending[0].message;
        assert_eq!(message["_queued"], true);
        assert!(message["_queuedAt"].is_string());
        assert_eq!(message["_originalTimestamp"], "t0");
        assert!(pending[0].expires_at > pending[0].enqueued_at);
    }

    #[test]
    fn test_delivery_tracking_two_clients() {
        let q = queue();
        q.track_client("s", "c1");
        q.track_client("s", "c2");
        let m1 = q
            .queue("s", json!({"type": "a"}), QueueOptions::default())
            .unwrap();
        let m2 = q
            .queue("s", json!({"type": "b"}), QueueOptions::default())
            .unwrap();

        q.mark_delivered(&[m1.clone()], "c1");
        let c1_pending = q.get_undelivered("s", "c1");
        assert_eq!(c1_pending.len(), 1);
        assert_eq!(c1_pending[0].id, m2);

        let c2_pending = q.get_undelivered("s", "c2");
        assert_eq!(c2_pending.len(), 2);

        q.mark_delivered(&[m1, m2.clone()], "c2");
        q.mark_delivered(&[m2], "c1");
        assert!(!q.has_queued("s"));
    }

    #[test]
    fn test_high_priority_surfaces_first() {
        let q = queue();
        q.track_client("s", "c");
        let normal = q
            .queue("s", json!({"n": 1}), QueueOptions::default())
            .unwrap();
        let low = q
            .queue(
                "s",
                json!({"n": 2}),
                QueueOptions {
                    priority: Priority::Low,
                    ..Default::default()
                },
            )
            .unwrap();
        let high = q
            .queue(
                "s",
                json!({"n": 3}),
                QueueOptions {
                    priority: Priority::High,
                    ..Default::default()
                },
            )
            .unwrap();

        let order: Vec<String> = q
            .get_undelivered("s", "c")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![high, normal, low]);
    }

    #[test]
    fn test_deliver_returns_ids_in_order() {
        let q = queue();
        q.track_client("s", "c");
        let m1 = q.queue("s", json!({"n": 1}), QueueOptions::default()).unwrap();
        let m2 = q.queue("s", json!({"n": 2}), QueueOptions::default()).unwrap();

        let mut seen = Vec::new();
        let delivered = q.deliver("s", "c", |m| seen.push(m["n"].as_i64().unwrap()));
        assert_eq!(delivered, vec![m1, m2]);
        assert_eq!(seen, vec![1, 2]);
        assert!(!q.has_queued("s"));
    }

    #[test]
    fn test_cleanup_expired_drops_sessions() {
        let q = queue();
        q.track_client("s", "c");
        q.queue(
            "s",
            json!({"type": "a"}),
            QueueOptions {
                ttl: Some(Duration::from_millis(0)),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(q.cleanup_expired(), 1);
        assert_eq!(q.queued_count("s"), 0);
        assert!(!q.has_queued("s"));
        // The tracked-client set went with the session.
        assert!(q.sessions.read().get("s").is_none());
    }

    #[test]
    fn test_expired_entries_not_delivered() {
        let q = queue();
        q.track_client("s", "c");
        q.queue(
            "s",
            json!({"type": "a"}),
            QueueOptions {
                ttl: Some(Duration::from_millis(0)),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(q.get_undelivered("s", "c").is_empty());
        assert!(!q.has_queued("s"));
    }

    #[test]
    fn test_cleanup_timer_not_started_by_constructor() {
        let q = queue();
        assert!(!q.is_cleanup_running());
    }
}
