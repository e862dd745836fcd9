//! WebSocket endpoint
//!
//! Clients connect to `/ws` with a bearer token in the query string or
//! the `Authorization` header, subscribe to sessions, submit prompts,
//! and answer permission requests. Each socket gets a single writer task
//! fed over a channel, so outbound frames are serialized per client.

use crate::core::connections::{ClientTransport, CLOSE_INTERNAL_ERROR};
use crate::core::devices::{DeviceInfo, DeviceRegistry};
use crate::core::permissions::PermissionManager;
use crate::core::push::PushNotifier;
use crate::core::queue::MessageQueue;
use crate::core::sessions::SessionManager;
use crate::core::tasks::{LongRunningTaskManager, TaskHandle};
use aicli_runner::{AiCliRunner, RunnerOptions};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::core::connections::ConnectionRegistry;

/// Outbound frame buffer per client
const OUTBOUND_BUFFER: usize = 100;

/// Everything the socket handlers need.
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<MessageQueue>,
    pub sessions: Arc<SessionManager>,
    pub devices: Arc<DeviceRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub tasks: Arc<LongRunningTaskManager>,
    pub runner: Arc<AiCliRunner>,
    pub notifier: Arc<PushNotifier>,
}

/// Build the WebSocket and health routes.
pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "OK"
}

/// WebSocket connection query parameters.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    /// Bearer token (alternative to the Authorization header)
    pub token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsConnectQuery>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let token = query.token.clone().or_else(|| bearer_from_headers(&headers));
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Extract `Authorization: Bearer …`.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
    Terminate,
}

/// Transport handle backed by the socket's writer task.
struct WsTransport {
    tx: mpsc::Sender<Outbound>,
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.tx
            .send(Outbound::Text(text.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("connection writer gone"))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.tx
            .send(Outbound::Ping)
            .await
            .map_err(|_| anyhow::anyhow!("connection writer gone"))
    }

    fn terminate(&self) {
        let _ = self.tx.try_send(Outbound::Terminate);
    }

    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()> {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("connection writer gone"))
    }
}

/// Single writer per socket: everything outbound flows through here.
async fn run_writer(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Text(text) => sender.send(Message::Text(text)).await,
            Outbound::Ping => sender.send(Message::Ping(Vec::new())).await,
            Outbound::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            Outbound::Terminate => break,
        };
        if let Err(e) = result {
            debug!("Writer send failed: {e}");
            break;
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, token: Option<String>) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(run_writer(sender, rx));
    let transport: Arc<WsTransport> = Arc::new(WsTransport { tx });

    let accepted = state
        .registry
        .accept(
            transport.clone(),
            token.as_deref(),
            json!({ "transport": "websocket" }),
        )
        .await;
    let Some(client_id) = accepted else {
        drop(transport);
        let _ = writer.await;
        return;
    };

    let mut disconnect_reason = "Connection closed".to_string();
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.registry.update_activity(&client_id);
                handle_client_message(&text, &client_id, transport.as_ref(), &state).await;
            }
            Ok(Message::Pong(_)) => state.registry.handle_pong(&client_id),
            Ok(Message::Ping(_)) => {
                // Pong is produced by axum automatically.
                state.registry.update_activity(&client_id);
            }
            Ok(Message::Binary(data)) => {
                debug!(client_id = %client_id, "Ignoring binary frame ({} bytes)", data.len());
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                error!(client_id = %client_id, "WebSocket receive error: {e}");
                disconnect_reason = format!("Transport error: {e}");
                let _ = transport.close(CLOSE_INTERNAL_ERROR, "Internal error").await;
                break;
            }
        }
    }

    state
        .registry
        .handle_disconnection(&client_id, &disconnect_reason);
    writer.abort();
    info!(client_id = %client_id, "Socket handler finished");
}

/// Client-to-server verbs.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to a session and drain any queued backlog.
    Subscribe {
        session_id: String,
        #[serde(default)]
        events: Vec<String>,
    },
    /// Detach from a session.
    Unsubscribe { session_id: String },
    /// Submit a prompt for a session.
    Prompt {
        session_id: String,
        prompt: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Answer a pending permission request.
    PermissionResponse {
        request_id: String,
        session_id: String,
        device_id: String,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Announce the device behind this client.
    RegisterDevice {
        user_id: String,
        device_id: String,
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        app_version: Option<String>,
        #[serde(default)]
        push_token: Option<String>,
    },
    /// Claim the primary role for a session.
    ElectPrimary {
        user_id: String,
        session_id: String,
        device_id: String,
    },
    /// Terminate a session's child process and drop the session.
    KillSession { session_id: String },
    /// Application-level ping.
    Ping,
}

async fn send_frame(transport: &dyn ClientTransport, frame_type: &str, data: Value) {
    let frame = json!({
        "type": frame_type,
        "data": data,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let _ = transport.send_text(&frame.to_string()).await;
}

async fn handle_client_message(
    text: &str,
    client_id: &str,
    transport: &dyn ClientTransport,
    state: &Arc<GatewayState>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            send_frame(transport, "error", json!({ "message": format!("Invalid message: {e}") }))
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { session_id, events } => {
            state.sessions.ensure(&session_id, None);
            state.registry.add_session(client_id, &session_id);
            state.queue.track_client(&session_id, client_id);
            if !events.is_empty() {
                state.registry.subscribe(client_id, &events);
            }

            // Drain the backlog queued while this client was away.
            let pending = state.queue.get_undelivered(&session_id, client_id);
            let mut delivered = Vec::with_capacity(pending.len());
            for entry in &pending {
                if transport.send_text(&entry.message.to_string()).await.is_ok() {
                    delivered.push(entry.id.clone());
                }
            }
            if !delivered.is_empty() {
                state.queue.mark_delivered(&delivered, client_id);
            }

            send_frame(
                transport,
                "subscribed",
                json!({ "sessionId": session_id, "queuedDelivered": delivered.len() }),
            )
            .await;
        }
        ClientMessage::Unsubscribe { session_id } => {
            state.registry.remove_session(client_id, &session_id);
            send_frame(transport, "unsubscribed", json!({ "sessionId": session_id })).await;
        }
        ClientMessage::Prompt {
            session_id,
            prompt,
            request_id,
        } => {
            let info = state.sessions.ensure(&session_id, None);
            state
                .sessions
                .mark_conversation_started(&session_id, Some(&prompt));

            let runner = Arc::clone(&state.runner);
            let session = session_id.clone();
            let prompt_text = prompt.clone();
            let mut builder = RunnerOptions::builder().working_dir(info.working_dir);
            if let Some(id) = request_id {
                builder = builder.request_id(id);
            }
            let options = builder.build();
            let execute = async move {
                runner
                    .run(&session, &prompt_text, &options)
                    .await
                    .map_err(anyhow::Error::from)
            };

            match state.tasks.handle(&session_id, &prompt, execute).await {
                TaskHandle::Completed(Ok(result)) => {
                    send_frame(transport, "conversationResult", result).await;
                }
                TaskHandle::Completed(Err(e)) => {
                    send_frame(
                        transport,
                        "error",
                        json!({ "sessionId": session_id, "message": e.to_string() }),
                    )
                    .await;
                }
                TaskHandle::LongRunning(ack) => {
                    let data = serde_json::to_value(&ack).unwrap_or(Value::Null);
                    send_frame(transport, "status", data).await;
                }
            }
        }
        ClientMessage::PermissionResponse {
            request_id,
            session_id,
            device_id,
            approved,
            reason,
        } => {
            // Only the session's primary device speaks for it.
            let primary = state.devices.get_primary_device(&session_id);
            if primary.as_deref() != Some(device_id.as_str()) {
                send_frame(
                    transport,
                    "error",
                    json!({
                        "message": "device is not primary for this session",
                        "requestId": request_id,
                    }),
                )
                .await;
                return;
            }
            state.devices.update_last_seen(&device_id);

            let handled = if approved {
                state
                    .permissions
                    .approve_request(&request_id, Some(&device_id))
            } else {
                state
                    .permissions
                    .deny_request(&request_id, reason.as_deref(), Some(&device_id))
            };
            send_frame(
                transport,
                "permissionResult",
                json!({ "requestId": request_id, "handled": handled, "approved": approved }),
            )
            .await;
        }
        ClientMessage::RegisterDevice {
            user_id,
            device_id,
            platform,
            app_version,
            push_token,
        } => {
            let result = state.devices.register(
                &user_id,
                &device_id,
                DeviceInfo {
                    platform,
                    app_version,
                },
            );
            state
                .registry
                .set_device(client_id, &device_id, push_token.clone());
            if let Some(token) = push_token {
                state.notifier.register_token(client_id, &token);
            }
            send_frame(
                transport,
                "deviceRegistered",
                serde_json::to_value(&result.device).unwrap_or(Value::Null),
            )
            .await;
        }
        ClientMessage::ElectPrimary {
            user_id,
            session_id,
            device_id,
        } => {
            state.devices.update_last_seen(&device_id);
            let result = state.devices.elect_primary(&user_id, &session_id, &device_id);
            send_frame(
                transport,
                "primaryElection",
                json!({
                    "sessionId": session_id,
                    "deviceId": device_id,
                    "success": result.success,
                    "isPrimary": result.is_primary,
                    "primaryDeviceId": result.primary_device_id,
                    "reason": result.reason,
                }),
            )
            .await;
        }
        ClientMessage::KillSession { session_id } => {
            let killed = state.sessions.kill(&session_id).await;
            state.registry.remove_session(client_id, &session_id);
            send_frame(
                transport,
                "sessionKilled",
                json!({ "sessionId": session_id, "killed": killed }),
            )
            .await;
        }
        ClientMessage::Ping => {
            send_frame(transport, "pong", Value::Null).await;
        }
    }
}
