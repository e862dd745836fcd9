//! WebSocket connection registry
//!
//! Tracks every admitted client: its transport handle, liveness bit,
//! session memberships, and event subscriptions. The registry owns the
//! ping/pong liveness cycle; transports are injected behind
//! [`ClientTransport`] so tests run against in-memory fakes.

use crate::core::events::{EventBus, GatewayEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close code sent to every client on shutdown
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for authentication failures
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for transport errors
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Disconnect reason used by the liveness monitor
pub const DISCONNECT_NO_PONG: &str = "Connection lost - no pong received";

/// Outbound side of one client connection.
///
/// Implementations must serialize writes per client; the WebSocket
/// implementation does so with a single writer task.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send a text frame.
    async fn send_text(&self, text: &str) -> anyhow::Result<()>;
    /// Send a ping frame.
    async fn ping(&self) -> anyhow::Result<()>;
    /// Tear the connection down immediately, no close handshake.
    fn terminate(&self);
    /// Close with a code and reason.
    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()>;
}

struct ClientEntry {
    transport: Arc<dyn ClientTransport>,
    session_ids: HashSet<String>,
    subscribed_events: HashSet<String>,
    is_alive: bool,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    device_id: Option<String>,
    device_token: Option<String>,
}

/// Snapshot of one client's bookkeeping state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub session_ids: Vec<String>,
    pub subscribed_events: Vec<String>,
    pub is_alive: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// A client addressed through its transport, as returned by session and
/// subscription lookups.
#[derive(Clone)]
pub struct SessionClient {
    pub client_id: String,
    pub transport: Arc<dyn ClientTransport>,
}

/// Registry of live client connections.
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ClientEntry>>,
    auth_token: Option<String>,
    bus: EventBus,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    pub fn new(auth_token: Option<String>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            auth_token,
            bus,
            health_task: Mutex::new(None),
        })
    }

    /// Admit a new connection.
    ///
    /// When a bearer token is configured, a missing or mismatched token
    /// closes the transport with 1008 and returns `None`. On success the
    /// minted client id is returned and `clientConnected` is emitted.
    pub async fn accept(
        &self,
        transport: Arc<dyn ClientTransport>,
        provided_token: Option<&str>,
        connection_info: Value,
    ) -> Option<String> {
        if let Some(ref expected) = self.auth_token {
            if provided_token != Some(expected.as_str()) {
                warn!("Rejecting connection: bad or missing bearer token");
                let _ = transport
                    .close(CLOSE_POLICY_VIOLATION, "Unauthorized")
                    .await;
                return None;
            }
        }

        let client_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.clients.write().insert(
            client_id.clone(),
            ClientEntry {
                transport,
                session_ids: HashSet::new(),
                subscribed_events: HashSet::new(),
                is_alive: true,
                connected_at: now,
                last_activity: now,
                device_id: None,
                device_token: None,
            },
        );

        info!(client_id = %client_id, "Client connected");
        self.bus.emit(GatewayEvent::ClientConnected {
            client_id: client_id.clone(),
            connection_info,
        });
        Some(client_id)
    }

    /// Pong received: refresh activity and mark alive.
    pub fn handle_pong(&self, client_id: &str) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.is_alive = true;
            entry.last_activity = Utc::now();
        }
    }

    /// Refresh a client's last-activity timestamp.
    pub fn update_activity(&self, client_id: &str) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.last_activity = Utc::now();
        }
    }

    /// Force a client's liveness bit (the monitor flips it each tick).
    pub fn set_alive(&self, client_id: &str, alive: bool) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.is_alive = alive;
        }
    }

    /// Remove a client and announce the disconnection.
    pub fn handle_disconnection(&self, client_id: &str, reason: &str) {
        let removed = self.clients.write().remove(client_id).is_some();
        if removed {
            info!(client_id = %client_id, reason, "Client disconnected");
            self.bus.emit(GatewayEvent::ClientDisconnected {
                client_id: client_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Attach a client to a session. No-op on unknown client.
    pub fn add_session(&self, client_id: &str, session_id: &str) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.session_ids.insert(session_id.to_string());
        }
    }

    /// Detach a client from a session. No-op on unknown client.
    pub fn remove_session(&self, client_id: &str, session_id: &str) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.session_ids.remove(session_id);
        }
    }

    /// Subscribe a client to one or more event topics.
    pub fn subscribe(&self, client_id: &str, events: &[String]) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            for event in events {
                entry.subscribed_events.insert(event.clone());
            }
        }
    }

    /// Record the device identity a client announced.
    pub fn set_device(&self, client_id: &str, device_id: &str, token: Option<String>) {
        if let Some(entry) = self.clients.write().get_mut(client_id) {
            entry.device_id = Some(device_id.to_string());
            entry.device_token = token;
        }
    }

    /// Device id a client announced, if any.
    pub fn device_of(&self, client_id: &str) -> Option<String> {
        self.clients
            .read()
            .get(client_id)
            .and_then(|e| e.device_id.clone())
    }

    pub fn get_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients
            .read()
            .get(client_id)
            .map(|entry| snapshot(client_id, entry))
    }

    pub fn get_all_clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .iter()
            .map(|(id, entry)| snapshot(id, entry))
            .collect()
    }

    /// Clients currently attached to a session.
    pub fn get_clients_by_session(&self, session_id: &str) -> Vec<SessionClient> {
        self.clients
            .read()
            .iter()
            .filter(|(_, entry)| entry.session_ids.contains(session_id))
            .map(|(id, entry)| SessionClient {
                client_id: id.clone(),
                transport: entry.transport.clone(),
            })
            .collect()
    }

    /// Clients subscribed to an event topic.
    pub fn get_subscribers(&self, event: &str) -> Vec<SessionClient> {
        self.clients
            .read()
            .iter()
            .filter(|(_, entry)| entry.subscribed_events.contains(event))
            .map(|(id, entry)| SessionClient {
                client_id: id.clone(),
                transport: entry.transport.clone(),
            })
            .collect()
    }

    /// Every connected client's transport.
    pub fn all_transports(&self) -> Vec<SessionClient> {
        self.clients
            .read()
            .iter()
            .map(|(id, entry)| SessionClient {
                client_id: id.clone(),
                transport: entry.transport.clone(),
            })
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Subscription accounting: total and per-event counts.
    pub fn subscription_stats(&self) -> (usize, HashMap<String, usize>) {
        let clients = self.clients.read();
        let mut per_event: HashMap<String, usize> = HashMap::new();
        let mut total = 0;
        for entry in clients.values() {
            total += entry.subscribed_events.len();
            for event in &entry.subscribed_events {
                *per_event.entry(event.clone()).or_default() += 1;
            }
        }
        (total, per_event)
    }

    /// One liveness pass over every client.
    ///
    /// A client that failed to pong since the previous pass is terminated
    /// and disconnected with [`DISCONNECT_NO_PONG`]; everyone else has
    /// their liveness bit cleared and receives a ping. A ping error also
    /// terminates.
    pub async fn health_check_tick(&self) {
        let snapshot: Vec<(String, Arc<dyn ClientTransport>, bool)> = self
            .clients
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.transport.clone(), entry.is_alive))
            .collect();

        for (client_id, transport, is_alive) in snapshot {
            if !is_alive {
                transport.terminate();
                self.handle_disconnection(&client_id, DISCONNECT_NO_PONG);
                continue;
            }
            self.set_alive(&client_id, false);
            if transport.ping().await.is_err() {
                transport.terminate();
                self.handle_disconnection(&client_id, "Ping failed");
            }
        }
    }

    /// Start the periodic liveness monitor. A second start is a no-op.
    pub fn start_health_monitoring(self: &Arc<Self>, period: Duration) {
        let mut guard = self.health_task.lock();
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.health_check_tick().await;
            }
        }));
        debug!("Health monitoring started");
    }

    /// Stop the liveness monitor.
    pub fn stop_health_monitoring(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
            debug!("Health monitoring stopped");
        }
    }

    /// Whether the liveness monitor is currently running.
    pub fn is_health_monitoring(&self) -> bool {
        self.health_task.lock().is_some()
    }

    /// Close every connection with 1001 and clear the registry. Errors
    /// thrown during close are swallowed.
    pub async fn shutdown(&self) {
        self.stop_health_monitoring();
        let transports: Vec<Arc<dyn ClientTransport>> = {
            let mut clients = self.clients.write();
            let transports = clients.values().map(|e| e.transport.clone()).collect();
            clients.clear();
            transports
        };
        for transport in transports {
            let _ = transport.close(CLOSE_GOING_AWAY, "Server shutting down").await;
        }
        info!("Connection registry shut down");
    }
}

fn snapshot(client_id: &str, entry: &ClientEntry) -> ClientInfo {
    ClientInfo {
        client_id: client_id.to_string(),
        session_ids: entry.session_ids.iter().cloned().collect(),
        subscribed_events: entry.subscribed_events.iter().cloned().collect(),
        is_alive: entry.is_alive,
        connected_at: entry.connected_at,
        last_activity: entry.last_activity,
        device_id: entry.device_id.clone(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn registry(token: Option<&str>) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(token.map(String::from), EventBus::new())
    }

    #[tokio::test]
    async fn test_accept_without_auth() {
        let registry = registry(None);
        let transport = RecordingTransport::new();
        let client_id = registry
            .accept(transport, None, json!({"remote": "test"}))
            .await
            .unwrap();
        assert!(registry.get_client(&client_id).is_some());
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_accept_rejects_bad_token() {
        let registry = registry(Some("secret"));
        let transport = RecordingTransport::new();
        let result = registry
            .accept(transport.clone(), Some("wrong"), json!({}))
            .await;
        assert!(result.is_none());
        let closes = transport.closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, CLOSE_POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn test_accept_rejects_missing_token() {
        let registry = registry(Some("secret"));
        let transport = RecordingTransport::new();
        assert!(registry.accept(transport, None, json!({})).await.is_none());
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_session_bookkeeping() {
        let registry = registry(None);
        let transport = RecordingTransport::new();
        let id = registry.accept(transport, None, json!({})).await.unwrap();

        registry.add_session(&id, "s1");
        registry.add_session(&id, "s2");
        assert_eq!(registry.get_clients_by_session("s1").len(), 1);

        registry.remove_session(&id, "s1");
        assert!(registry.get_clients_by_session("s1").is_empty());
        assert_eq!(registry.get_clients_by_session("s2").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_client_ops_are_noops() {
        let registry = registry(None);
        registry.add_session("ghost", "s1");
        registry.remove_session("ghost", "s1");
        registry.subscribe("ghost", &["deviceRegistered".into()]);
        registry.handle_pong("ghost");
        registry.update_activity("ghost");
        registry.handle_disconnection("ghost", "bye");
        assert!(registry.get_client("ghost").is_none());
    }

    #[tokio::test]
    async fn test_liveness_teardown() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let registry = ConnectionRegistry::new(None, bus);
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, json!({}))
            .await
            .unwrap();
        // Drain the connect event.
        let _ = events.recv().await.unwrap();

        registry.set_alive(&id, false);
        registry.health_check_tick().await;

        assert_eq!(transport.terminations.load(Ordering::SeqCst), 1);
        assert!(registry.get_all_clients().is_empty());
        match events.recv().await.unwrap() {
            GatewayEvent::ClientDisconnected { reason, .. } => {
                assert_eq!(reason, DISCONNECT_NO_PONG);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_liveness_pings_responsive_clients() {
        let registry = registry(None);
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, json!({}))
            .await
            .unwrap();

        registry.health_check_tick().await;
        assert_eq!(transport.pings.load(Ordering::SeqCst), 1);
        assert!(!registry.get_client(&id).unwrap().is_alive);

        // Pong restores liveness before the next tick.
        registry.handle_pong(&id);
        assert!(registry.get_client(&id).unwrap().is_alive);
    }

    #[tokio::test]
    async fn test_ping_failure_terminates() {
        let registry = registry(None);
        let transport = RecordingTransport::new();
        transport.fail_pings.store(true, Ordering::SeqCst);
        registry
            .accept(transport.clone(), None, json!({}))
            .await
            .unwrap();

        registry.health_check_tick().await;
        assert_eq!(transport.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_start_health_monitoring_idempotent() {
        let registry = registry(None);
        registry.start_health_monitoring(Duration::from_secs(30));
        registry.start_health_monitoring(Duration::from_secs(30));
        assert!(registry.is_health_monitoring());
        registry.stop_health_monitoring();
        assert!(!registry.is_health_monitoring());
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let registry = registry(None);
        let t1 = RecordingTransport::new();
        let t2 = RecordingTransport::new();
        registry.accept(t1.clone(), None, json!({})).await.unwrap();
        registry.accept(t2.clone(), None, json!({})).await.unwrap();

        registry.shutdown().await;
        assert_eq!(registry.client_count(), 0);
        assert_eq!(t1.closes.lock()[0].0, CLOSE_GOING_AWAY);
        assert_eq!(t2.closes.lock()[0].0, CLOSE_GOING_AWAY);
    }

    #[tokio::test]
    async fn test_subscription_stats() {
        let registry = registry(None);
        let id = registry
            .accept(RecordingTransport::new(), None, json!({}))
            .await
            .unwrap();
        registry.subscribe(&id, &["a".into(), "b".into()]);
        let (total, per_event) = registry.subscription_stats();
        assert_eq!(total, 2);
        assert_eq!(per_event["a"], 1);
    }
}
