//! Event broadcaster
//!
//! Consumes the runner's typed event stream and routes each event to the
//! clients attached to its session. Every session-routed message is also
//! buffered in the message queue so tracked-but-disconnected clients
//! receive it when they come back; clients reached directly are marked
//! delivered immediately.

use crate::core::connections::ConnectionRegistry;
use crate::core::events::{EventBus, GatewayEvent};
use crate::core::queue::{MessageQueue, QueueOptions};
use aicli_runner::StreamEvent;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Broadcast accounting snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStats {
    pub connected_clients: usize,
    pub total_subscriptions: usize,
    pub event_subscriptions: HashMap<String, usize>,
    pub active_listeners: usize,
}

/// Routes runner events to session clients and the message queue.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<MessageQueue>,
    bus: EventBus,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<MessageQueue>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            bus,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Attach a listener task to a runner event stream. Call once per
    /// runner; `shutdown` detaches everything.
    pub fn start(self: &Arc<Self>, mut rx: broadcast::Receiver<StreamEvent>) {
        let broadcaster = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => broadcaster.handle_stream_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.lock().push(handle);
    }

    /// Route one event: frame it, deliver to connected session clients,
    /// buffer for absent ones, announce the broadcast.
    pub async fn handle_stream_event(&self, event: StreamEvent) {
        let session_id = event.session_id().to_string();
        if session_id.is_empty() {
            debug!("Dropping event without session id");
            return;
        }

        let message_type = event.name().to_string();
        let wire = serde_json::json!({
            "type": message_type,
            "data": event.payload(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        let text = wire.to_string();

        // Buffer first: the queue is the source of truth for clients
        // that miss the live send.
        let message_id = self.queue.queue(&session_id, wire, QueueOptions::default());

        let clients = self.registry.get_clients_by_session(&session_id);
        let mut delivered = 0;
        for client in &clients {
            match client.transport.send_text(&text).await {
                Ok(()) => {
                    delivered += 1;
                    if let Some(ref id) = message_id {
                        self.queue
                            .mark_delivered(std::slice::from_ref(id), &client.client_id);
                    }
                }
                Err(e) => {
                    // Transport failure never fails the producer; the
                    // queued copy reaches this client on reconnect.
                    debug!(client_id = %client.client_id, "Send failed, relying on queue: {e}");
                }
            }
        }

        self.bus.emit(GatewayEvent::MessageBroadcast {
            session_id,
            message_type,
            client_count: delivered,
        });
    }

    /// Send a framed message to every connected client.
    pub async fn broadcast_to_all(&self, message_type: &str, data: Value) -> usize {
        let wire = serde_json::json!({
            "type": message_type,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();

        let mut delivered = 0;
        for client in self.registry.all_transports() {
            if client.transport.send_text(&wire).await.is_ok() {
                delivered += 1;
            }
        }
        self.bus.emit(GatewayEvent::SystemBroadcast {
            message_type: message_type.to_string(),
            client_count: delivered,
        });
        delivered
    }

    /// Publish a framed message to every client subscribed to a topic.
    pub async fn publish(&self, topic: &str, data: Value) -> usize {
        let wire = serde_json::json!({
            "type": topic,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();

        let mut delivered = 0;
        for client in self.registry.get_subscribers(topic) {
            if client.transport.send_text(&wire).await.is_ok() {
                delivered += 1;
            }
        }
        self.bus.emit(GatewayEvent::EventBroadcast {
            topic: topic.to_string(),
            client_count: delivered,
        });
        delivered
    }

    /// Detach every listener task.
    pub fn shutdown(&self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        debug!("Broadcaster shut down");
    }

    pub fn stats(&self) -> BroadcasterStats {
        let (total_subscriptions, event_subscriptions) = self.registry.subscription_stats();
        BroadcasterStats {
            connected_clients: self.registry.client_count(),
            total_subscriptions,
            event_subscriptions,
            active_listeners: self.listeners.lock().len(),
        }
    }
}
