//! Per-child health monitoring
//!
//! One monitor is created per spawned child process. Readers record
//! activity on every chunk; a heartbeat task logs liveness every 30
//! seconds while the child runs. `cleanup` is idempotent and must fire on
//! every exit path, including cancellation of the owning operation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default heartbeat period
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Health monitor for one child process.
pub struct HealthMonitor {
    session_id: String,
    last_activity: Mutex<Instant>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    cleaned: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor for a session's child process.
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            last_activity: Mutex::new(Instant::now()),
            heartbeat: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        })
    }

    /// Record output activity from the child.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Seconds since the child last produced output.
    pub fn seconds_since_activity(&self) -> u64 {
        self.last_activity.lock().elapsed().as_secs()
    }

    /// Start the heartbeat log task. A second start is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>, period: Duration) {
        let mut guard = self.heartbeat.lock();
        if guard.is_some() || self.cleaned.load(Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                info!(
                    session_id = %monitor.session_id,
                    idle_secs = monitor.seconds_since_activity(),
                    "AICLI process heartbeat"
                );
            }
        }));
    }

    /// Stop the heartbeat and mark the monitor released. Idempotent.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        debug!(session_id = %self.session_id, "Health monitor released");
    }

    /// Whether `cleanup` has already run.
    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if !self.cleaned.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.heartbeat.lock().take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_activity_tracking() {
        let monitor = HealthMonitor::new("s1");
        monitor.record_activity();
        assert!(monitor.seconds_since_activity() < 2);
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let monitor = HealthMonitor::new("s1");
        monitor.start_heartbeat(Duration::from_secs(30));
        assert!(!monitor.is_cleaned());
        monitor.cleanup();
        monitor.cleanup();
        assert!(monitor.is_cleaned());
    }

    #[tokio::test]
    async fn test_start_after_cleanup_is_noop() {
        let monitor = HealthMonitor::new("s1");
        monitor.cleanup();
        monitor.start_heartbeat(Duration::from_secs(30));
        assert!(monitor.heartbeat.lock().is_none());
    }
}
