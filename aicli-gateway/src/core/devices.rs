//! Device registry and per-session primary election
//!
//! Tracks every push-capable endpoint a user registers and elects, per
//! session, the single device whose permission responses are
//! authoritative. Election, transfer, and timeout all mutate the same
//! state under one lock, so check-then-set races collapse to one winner.

use crate::core::events::{EventBus, GatewayEvent};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A registered device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Registration metadata supplied by the client.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub platform: Option<String>,
    pub app_version: Option<String>,
}

/// Outcome of a registration call.
#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub success: bool,
    pub device: Device,
}

/// Outcome of an election or transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    pub success: bool,
    pub is_primary: bool,
    pub primary_device_id: Option<String>,
    pub reason: Option<&'static str>,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub total_devices: usize,
    pub active_devices: usize,
    pub inactive_devices: usize,
    pub total_users: usize,
    pub primary_devices: usize,
    pub average_devices_per_user: f64,
}

#[derive(Default)]
struct DeviceState {
    devices: HashMap<String, Device>,
    user_devices: HashMap<String, HashSet<String>>,
    primary_by_session: HashMap<String, String>,
    sessions_by_device: HashMap<String, HashSet<String>>,
}

/// Registry of devices with per-session primary election.
pub struct DeviceRegistry {
    state: Mutex<DeviceState>,
    device_timeout: ChronoDuration,
    bus: EventBus,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(device_timeout: Duration, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState::default()),
            device_timeout: ChronoDuration::from_std(device_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            bus,
            monitor_task: Mutex::new(None),
        })
    }

    /// Register (or re-register) a device for a user. Missing platform
    /// defaults to `"unknown"`. Emits `deviceRegistered`.
    pub fn register(&self, user_id: &str, device_id: &str, info: DeviceInfo) -> RegisterResult {
        let now = Utc::now();
        let device = Device {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            platform: info.platform.unwrap_or_else(|| "unknown".to_string()),
            app_version: info.app_version,
            registered_at: now,
            last_seen: now,
        };

        {
            let mut state = self.state.lock();
            state.devices.insert(device_id.to_string(), device.clone());
            state
                .user_devices
                .entry(user_id.to_string())
                .or_default()
                .insert(device_id.to_string());
        }

        info!(user_id, device_id, "Device registered");
        self.bus.emit(GatewayEvent::DeviceRegistered {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        });
        RegisterResult {
            success: true,
            device,
        }
    }

    /// Refresh a device's last-seen timestamp. No-op if unknown.
    pub fn update_last_seen(&self, device_id: &str) {
        if let Some(device) = self.state.lock().devices.get_mut(device_id) {
            device.last_seen = Utc::now();
        }
    }

    /// Whether a device reported activity within the timeout window.
    pub fn is_active(&self, device_id: &str) -> bool {
        let state = self.state.lock();
        self.is_active_locked(&state, device_id)
    }

    fn is_active_locked(&self, state: &DeviceState, device_id: &str) -> bool {
        state
            .devices
            .get(device_id)
            .map(|d| Utc::now() - d.last_seen <= self.device_timeout)
            .unwrap_or(false)
    }

    /// Active devices for a user.
    pub fn get_active_devices(&self, user_id: &str) -> Vec<Device> {
        let state = self.state.lock();
        state
            .user_devices
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| self.is_active_locked(&state, id.as_str()))
                    .filter_map(|id| state.devices.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.state.lock().devices.get(device_id).cloned()
    }

    /// Current primary device for a session.
    pub fn get_primary_device(&self, session_id: &str) -> Option<String> {
        self.state.lock().primary_by_session.get(session_id).cloned()
    }

    /// Attempt to elect a device primary for a session.
    ///
    /// The entire check-then-set runs inside one critical section:
    /// under concurrent elections for the same session exactly one
    /// caller wins; the rest observe `primary_exists`.
    pub fn elect_primary(
        &self,
        user_id: &str,
        session_id: &str,
        device_id: &str,
    ) -> ElectionResult {
        let mut state = self.state.lock();

        if !self.is_active_locked(&state, device_id) {
            return ElectionResult {
                success: false,
                is_primary: false,
                primary_device_id: state.primary_by_session.get(session_id).cloned(),
                reason: Some("device_not_active"),
            };
        }

        if let Some(current) = state.primary_by_session.get(session_id).cloned() {
            if current == device_id {
                return ElectionResult {
                    success: true,
                    is_primary: true,
                    primary_device_id: Some(current),
                    reason: None,
                };
            }
            if self.is_active_locked(&state, &current) {
                return ElectionResult {
                    success: false,
                    is_primary: false,
                    primary_device_id: Some(current),
                    reason: Some("primary_exists"),
                };
            }
            // Stale primary: the old device timed out, drop its claim.
            self.remove_primary_locked(&mut state, session_id, &current);
        }

        state
            .primary_by_session
            .insert(session_id.to_string(), device_id.to_string());
        state
            .sessions_by_device
            .entry(device_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        drop(state);

        info!(session_id, device_id, user_id, "Primary device elected");
        self.bus.emit(GatewayEvent::PrimaryElected {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
        });
        ElectionResult {
            success: true,
            is_primary: true,
            primary_device_id: Some(device_id.to_string()),
            reason: None,
        }
    }

    /// Hand the primary role for a session to another device.
    pub fn transfer_primary(
        &self,
        session_id: &str,
        from_device_id: &str,
        to_device_id: &str,
    ) -> ElectionResult {
        let mut state = self.state.lock();

        let current = state.primary_by_session.get(session_id).cloned();
        if current.as_deref() != Some(from_device_id) {
            return ElectionResult {
                success: false,
                is_primary: false,
                primary_device_id: current,
                reason: Some("not_current_primary"),
            };
        }
        if !self.is_active_locked(&state, to_device_id) {
            return ElectionResult {
                success: false,
                is_primary: false,
                primary_device_id: current,
                reason: Some("target_device_inactive"),
            };
        }

        self.remove_primary_locked(&mut state, session_id, from_device_id);
        state
            .primary_by_session
            .insert(session_id.to_string(), to_device_id.to_string());
        state
            .sessions_by_device
            .entry(to_device_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        drop(state);

        info!(session_id, from_device_id, to_device_id, "Primary transferred");
        self.bus.emit(GatewayEvent::PrimaryTransferred {
            session_id: session_id.to_string(),
            from_device_id: from_device_id.to_string(),
            to_device_id: to_device_id.to_string(),
        });
        ElectionResult {
            success: true,
            is_primary: true,
            primary_device_id: Some(to_device_id.to_string()),
            reason: None,
        }
    }

    fn remove_primary_locked(&self, state: &mut DeviceState, session_id: &str, device_id: &str) {
        state.primary_by_session.remove(session_id);
        if let Some(sessions) = state.sessions_by_device.get_mut(device_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                state.sessions_by_device.remove(device_id);
            }
        }
    }

    /// Remove a device from the catalog, dropping every primary mapping
    /// it held. Emits `primaryDeviceOffline` per dropped session and
    /// `deviceUnregistered` once.
    pub fn unregister(&self, device_id: &str) {
        let (user_id, dropped_sessions) = {
            let mut state = self.state.lock();
            let Some(device) = state.devices.remove(device_id) else {
                return;
            };
            if let Some(ids) = state.user_devices.get_mut(&device.user_id) {
                ids.remove(device_id);
                if ids.is_empty() {
                    state.user_devices.remove(&device.user_id);
                }
            }
            let sessions: Vec<String> = state
                .sessions_by_device
                .remove(device_id)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            for session_id in &sessions {
                state.primary_by_session.remove(session_id);
            }
            (device.user_id, sessions)
        };

        for session_id in dropped_sessions {
            self.bus.emit(GatewayEvent::PrimaryDeviceOffline {
                session_id,
                device_id: device_id.to_string(),
            });
        }
        info!(device_id, user_id = %user_id, "Device unregistered");
        self.bus.emit(GatewayEvent::DeviceUnregistered {
            device_id: device_id.to_string(),
            user_id,
        });
    }

    /// One timeout pass: drop primary mappings whose device went
    /// inactive. Returns the dropped `(session, device)` pairs.
    pub fn check_primary_timeouts(&self) -> Vec<(String, String)> {
        let dropped = {
            let mut state = self.state.lock();
            let stale: Vec<(String, String)> = state
                .primary_by_session
                .iter()
                .filter(|(_, device_id)| !self.is_active_locked(&state, device_id.as_str()))
                .map(|(s, d)| (s.clone(), d.clone()))
                .collect();
            for (session_id, device_id) in &stale {
                self.remove_primary_locked(&mut state, session_id, device_id);
            }
            stale
        };

        for (session_id, device_id) in &dropped {
            debug!(session_id, device_id, "Primary device timed out");
            self.bus.emit(GatewayEvent::PrimaryDeviceTimeout {
                session_id: session_id.clone(),
                device_id: device_id.clone(),
            });
        }
        dropped
    }

    /// Start the periodic timeout monitor. A second start is a no-op.
    pub fn start_timeout_monitor(self: &Arc<Self>, period: Duration) {
        let mut guard = self.monitor_task.lock();
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.check_primary_timeouts();
            }
        }));
    }

    /// Stop the timeout monitor.
    pub fn stop_timeout_monitor(&self) {
        if let Some(handle) = self.monitor_task.lock().take() {
            handle.abort();
        }
    }

    /// Whether the timeout monitor is running.
    pub fn is_monitor_running(&self) -> bool {
        self.monitor_task.lock().is_some()
    }

    pub fn get_stats(&self) -> DeviceStats {
        let state = self.state.lock();
        let total_devices = state.devices.len();
        let active_devices = state
            .devices
            .keys()
            .filter(|id| self.is_active_locked(&state, id.as_str()))
            .count();
        let total_users = state.user_devices.len();
        DeviceStats {
            total_devices,
            active_devices,
            inactive_devices: total_devices - active_devices,
            total_users,
            primary_devices: state.primary_by_session.len(),
            average_devices_per_user: if total_users == 0 {
                0.0
            } else {
                total_devices as f64 / total_users as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<DeviceRegistry> {
        DeviceRegistry::new(Duration::from_secs(300), EventBus::new())
    }

    fn registry_with_timeout(timeout: Duration) -> Arc<DeviceRegistry> {
        DeviceRegistry::new(timeout, EventBus::new())
    }

    #[test]
    fn test_register_defaults_platform() {
        let r = registry();
        let result = r.register("u1", "d1", DeviceInfo::default());
        assert!(result.success);
        assert_eq!(result.device.platform, "unknown");
        assert!(r.is_active("d1"));
    }

    #[test]
    fn test_election_happy_path() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        let result = r.elect_primary("u1", "s1", "d1");
        assert!(result.success);
        assert!(result.is_primary);
        assert_eq!(r.get_primary_device("s1").as_deref(), Some("d1"));
    }

    #[test]
    fn test_election_rejects_inactive_device() {
        let r = registry();
        let result = r.elect_primary("u1", "s1", "ghost");
        assert!(!result.success);
        assert_eq!(result.reason, Some("device_not_active"));
    }

    #[test]
    fn test_election_rejects_second_device() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        r.register("u1", "d2", DeviceInfo::default());
        assert!(r.elect_primary("u1", "s1", "d1").success);

        let second = r.elect_primary("u1", "s1", "d2");
        assert!(!second.success);
        assert_eq!(second.reason, Some("primary_exists"));
        assert_eq!(second.primary_device_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_election_confirms_existing_primary() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        assert!(r.elect_primary("u1", "s1", "d1").success);
        let again = r.elect_primary("u1", "s1", "d1");
        assert!(again.success);
        assert!(again.is_primary);
    }

    #[tokio::test]
    async fn test_election_race_single_winner() {
        let r = registry();
        r.register("u", "d1", DeviceInfo::default());
        r.register("u", "d2", DeviceInfo::default());

        let r1 = Arc::clone(&r);
        let r2 = Arc::clone(&r);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.elect_primary("u", "s", "d1") }),
            tokio::spawn(async move { r2.elect_primary("u", "s", "d2") }),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_ne!(a.success, b.success, "exactly one election must win");
        let loser = if a.success { &b } else { &a };
        assert_eq!(loser.reason, Some("primary_exists"));

        let winner_device = if a.success { "d1" } else { "d2" };
        assert_eq!(r.get_primary_device("s").as_deref(), Some(winner_device));
    }

    #[test]
    fn test_transfer_primary() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        r.register("u1", "d2", DeviceInfo::default());
        r.elect_primary("u1", "s1", "d1");

        let wrong = r.transfer_primary("s1", "d2", "d1");
        assert_eq!(wrong.reason, Some("not_current_primary"));

        let to_ghost = r.transfer_primary("s1", "d1", "ghost");
        assert_eq!(to_ghost.reason, Some("target_device_inactive"));

        let ok = r.transfer_primary("s1", "d1", "d2");
        assert!(ok.success);
        assert_eq!(r.get_primary_device("s1").as_deref(), Some("d2"));
    }

    #[test]
    fn test_unregister_drops_primaries() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let r = DeviceRegistry::new(Duration::from_secs(300), bus);
        r.register("u1", "d1", DeviceInfo::default());
        r.elect_primary("u1", "s1", "d1");
        r.elect_primary("u1", "s2", "d1");

        r.unregister("d1");
        assert!(r.get_primary_device("s1").is_none());
        assert!(r.get_primary_device("s2").is_none());
        assert!(r.get_device("d1").is_none());

        let mut offline = 0;
        let mut unregistered = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                GatewayEvent::PrimaryDeviceOffline { .. } => offline += 1,
                GatewayEvent::DeviceUnregistered { .. } => unregistered += 1,
                _ => {}
            }
        }
        assert_eq!(offline, 2);
        assert_eq!(unregistered, 1);
    }

    #[test]
    fn test_reregister_restores_fresh_state() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        r.unregister("d1");
        let again = r.register("u1", "d1", DeviceInfo::default());
        assert!(again.success);
        assert!(r.is_active("d1"));
        assert_eq!(r.get_stats().total_devices, 1);
    }

    #[test]
    fn test_primary_timeout_sweep() {
        let r = registry_with_timeout(Duration::from_millis(0));
        r.register("u1", "d1", DeviceInfo::default());
        // Timeout of zero makes the device instantly inactive, but the
        // election check runs against the same clock, so install the
        // primary directly.
        r.state
            .lock()
            .primary_by_session
            .insert("s1".into(), "d1".into());

        let dropped = r.check_primary_timeouts();
        assert_eq!(dropped, vec![("s1".to_string(), "d1".to_string())]);
        assert!(r.get_primary_device("s1").is_none());
    }

    #[test]
    fn test_stats() {
        let r = registry();
        r.register("u1", "d1", DeviceInfo::default());
        r.register("u1", "d2", DeviceInfo::default());
        r.register("u2", "d3", DeviceInfo::default());
        r.elect_primary("u1", "s1", "d1");

        let stats = r.get_stats();
        assert_eq!(stats.total_devices, 3);
        assert_eq!(stats.active_devices, 3);
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.primary_devices, 1);
        assert!((stats.average_devices_per_user - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_monitor_not_started_by_constructor() {
        let r = registry();
        assert!(!r.is_monitor_running());
    }
}
