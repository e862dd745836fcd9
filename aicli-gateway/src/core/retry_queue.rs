//! Named work queues with retry, pause, and dead-lettering
//!
//! The generic counterpart to the session message queue: entries are
//! handed to an async handler, failed handlers are retried with
//! exponential backoff, and entries that exhaust their retries land in a
//! per-queue dead-letter set. Pausing stops processing; resuming drains.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handler invoked for each queue entry.
pub type EntryHandler =
    Arc<dyn Fn(QueueEntry) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Retry policy for one queue.
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// Total attempts per entry
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub base_delay: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub payload: Value,
    pub attempts: u32,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub messages_queued: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    dead_letter: Vec<QueueEntry>,
    paused: bool,
    draining: bool,
    stats: QueueStats,
}

/// A named queue that pushes entries through an async handler with
/// bounded retries.
pub struct RetryQueue {
    name: String,
    handler: EntryHandler,
    config: RetryQueueConfig,
    state: Mutex<QueueState>,
}

impl RetryQueue {
    pub fn new(name: impl Into<String>, config: RetryQueueConfig, handler: EntryHandler) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
            config,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a payload. Unless the queue is paused, a drain pass is
    /// started in the background.
    pub fn enqueue(self: &Arc<Self>, payload: Value) -> String {
        let id = Uuid::new_v4().to_string();
        let start_drain = {
            let mut state = self.state.lock();
            state.entries.push_back(QueueEntry {
                id: id.clone(),
                payload,
                attempts: 0,
            });
            state.stats.messages_queued += 1;
            !state.paused && !state.draining
        };
        if start_drain {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
        id
    }

    /// Stop processing; entries accumulate until resume.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        debug!(queue = %self.name, "Queue paused");
    }

    /// Resume and drain everything buffered while paused.
    pub async fn resume(self: &Arc<Self>) {
        self.state.lock().paused = false;
        debug!(queue = %self.name, "Queue resumed");
        self.drain().await;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Process entries until the queue is empty or paused. Concurrent
    /// drain calls collapse into one.
    pub async fn drain(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let entry = {
                let mut state = self.state.lock();
                if state.paused {
                    None
                } else {
                    state.entries.pop_front()
                }
            };
            let Some(entry) = entry else { break };
            self.process_entry(entry).await;
        }

        self.state.lock().draining = false;
    }

    async fn process_entry(&self, mut entry: QueueEntry) {
        loop {
            entry.attempts += 1;
            match (self.handler)(entry.clone()).await {
                Ok(_) => {
                    self.state.lock().stats.messages_processed += 1;
                    return;
                }
                Err(e) if entry.attempts < self.config.max_attempts => {
                    let delay = self.config.base_delay * 2u32.pow(entry.attempts - 1);
                    warn!(
                        queue = %self.name,
                        entry = %entry.id,
                        attempt = entry.attempts,
                        "Handler failed, retrying in {:?}: {e}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        entry = %entry.id,
                        "Handler failed after {} attempts, dead-lettering: {e}",
                        entry.attempts
                    );
                    let mut state = self.state.lock();
                    state.stats.messages_failed += 1;
                    state.dead_letter.push(entry);
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    /// Entries that exhausted their retries.
    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.state.lock().dead_letter.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}
