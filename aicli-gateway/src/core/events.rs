//! Gateway event bus
//!
//! One typed sum for everything the gateway announces about itself:
//! connection lifecycle, broadcast accounting, device elections,
//! permission outcomes, push delivery. Components hold a clone of the
//! [`EventBus`] and emit without knowing who listens.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcast buffer for gateway events
const EVENT_CHANNEL_SIZE: usize = 256;

/// Lifecycle and accounting events emitted by gateway components.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GatewayEvent {
    #[serde(rename_all = "camelCase")]
    ClientConnected {
        client_id: String,
        connection_info: Value,
    },
    #[serde(rename_all = "camelCase")]
    ClientDisconnected { client_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    MessageBroadcast {
        session_id: String,
        message_type: String,
        client_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    SystemBroadcast {
        message_type: String,
        client_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    EventBroadcast { topic: String, client_count: usize },
    #[serde(rename_all = "camelCase")]
    DeviceRegistered { user_id: String, device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceUnregistered { device_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    PrimaryElected {
        session_id: String,
        device_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PrimaryTransferred {
        session_id: String,
        from_device_id: String,
        to_device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PrimaryDeviceOffline {
        session_id: String,
        device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PrimaryDeviceTimeout {
        session_id: String,
        device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PermissionApproved { request: Value },
    #[serde(rename_all = "camelCase")]
    PermissionDenied { request: Value },
    #[serde(rename_all = "camelCase")]
    NotificationSent {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        recipient_count: usize,
    },
}

impl GatewayEvent {
    /// Event name as listeners see it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "clientConnected",
            Self::ClientDisconnected { .. } => "clientDisconnected",
            Self::MessageBroadcast { .. } => "messageBroadcast",
            Self::SystemBroadcast { .. } => "systemBroadcast",
            Self::EventBroadcast { .. } => "eventBroadcast",
            Self::DeviceRegistered { .. } => "deviceRegistered",
            Self::DeviceUnregistered { .. } => "deviceUnregistered",
            Self::PrimaryElected { .. } => "primaryElected",
            Self::PrimaryTransferred { .. } => "primaryTransferred",
            Self::PrimaryDeviceOffline { .. } => "primaryDeviceOffline",
            Self::PrimaryDeviceTimeout { .. } => "primaryDeviceTimeout",
            Self::PermissionApproved { .. } => "permissionApproved",
            Self::PermissionDenied { .. } => "permissionDenied",
            Self::NotificationSent { .. } => "notificationSent",
        }
    }
}

/// Shared broadcast bus for [`GatewayEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { tx }
    }

    /// Emit an event; silently dropped when nobody listens.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
