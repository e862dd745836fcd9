//! Push notification delivery
//!
//! Wraps an injected provider transport with per-token retry, dead-token
//! hygiene, and a concurrency cap for fan-out sends. Tokens the provider
//! reports as permanently undeliverable are never contacted again.

use crate::core::events::{EventBus, GatewayEvent};
use crate::utils::markdown::{strip_markdown, truncate};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Provider reasons that must never be retried
pub const TERMINAL_REASONS: [&str; 3] = ["BadDeviceToken", "Unregistered", "ExpiredProviderToken"];

/// Cap on notification body length
const MAX_BODY_CHARS: usize = 1000;

/// What a notification is about; shapes the payload clients receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Response,
    LongRunningCompletion,
    Error,
    PermissionRequest,
}

/// Provider-neutral notification payload. Text fields are Markdown-
/// stripped at construction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl PushPayload {
    pub fn new(title: &str, body: &str, kind: NotificationKind) -> Self {
        Self {
            title: strip_markdown(title),
            body: truncate(Some(body), MAX_BODY_CHARS),
            kind,
            session_id: None,
            data: Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// One failed delivery as reported by the provider.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub device: String,
    pub reason: String,
}

/// Provider response for one send call.
#[derive(Debug, Clone, Default)]
pub struct TransportReceipt {
    pub sent: Vec<String>,
    pub failed: Vec<FailedDelivery>,
}

/// The provider transport seam (APNs/FCM library lives behind it).
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, payload: &PushPayload, token: &str) -> TransportReceipt;
    async fn shutdown(&self);
}

/// Outcome of one notifier send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl SendOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// Totals for a fan-out send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutTotals {
    pub sent: usize,
    pub failed: usize,
}

/// Stand-in transport used when no provider library is wired: logs the
/// delivery and reports success.
#[derive(Default)]
pub struct LoggingPushTransport;

#[async_trait]
impl PushTransport for LoggingPushTransport {
    async fn send(&self, payload: &PushPayload, token: &str) -> TransportReceipt {
        info!(kind = ?payload.kind, "Push (log only): {}", payload.title);
        TransportReceipt {
            sent: vec![token.to_string()],
            failed: vec![],
        }
    }

    async fn shutdown(&self) {}
}

/// Push notifier with retry and token hygiene.
pub struct PushNotifier {
    transport: Arc<dyn PushTransport>,
    device_tokens: RwLock<HashMap<String, String>>,
    bad_tokens: RwLock<HashSet<String>>,
    retries: u32,
    fanout: Arc<Semaphore>,
    bus: EventBus,
}

impl PushNotifier {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        retries: u32,
        max_concurrent: usize,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            device_tokens: RwLock::new(HashMap::new()),
            bad_tokens: RwLock::new(HashSet::new()),
            retries,
            fanout: Arc::new(Semaphore::new(max_concurrent)),
            bus,
        })
    }

    /// Associate a client with its push token.
    pub fn register_token(&self, client_id: &str, token: &str) {
        self.device_tokens
            .write()
            .insert(client_id.to_string(), token.to_string());
        debug!(client_id, "Push token registered");
    }

    pub fn remove_client(&self, client_id: &str) {
        self.device_tokens.write().remove(client_id);
    }

    pub fn token_for(&self, client_id: &str) -> Option<String> {
        self.device_tokens.read().get(client_id).cloned()
    }

    pub fn is_bad_token(&self, token: &str) -> bool {
        self.bad_tokens.read().contains(token)
    }

    pub fn bad_token_count(&self) -> usize {
        self.bad_tokens.read().len()
    }

    /// Deliver one payload to one token.
    ///
    /// Known-bad tokens short-circuit with zero transport calls.
    /// Transient provider reasons are retried up to `retries` attempts;
    /// terminal reasons return immediately, and `BadDeviceToken` /
    /// `Unregistered` evict the token.
    pub async fn send(&self, token: &str, payload: &PushPayload) -> SendOutcome {
        self.send_with_retries(token, payload, self.retries).await
    }

    /// As [`send`](Self::send) with an explicit retry budget.
    pub async fn send_with_retries(
        &self,
        token: &str,
        payload: &PushPayload,
        retries: u32,
    ) -> SendOutcome {
        if self.is_bad_token(token) {
            debug!("Skipping known-bad token");
            return SendOutcome::failed("BadDeviceToken");
        }

        for attempt in 1..=retries.max(1) {
            let receipt = self.transport.send(payload, token).await;
            if receipt.failed.is_empty() {
                self.bus.emit(GatewayEvent::NotificationSent {
                    request_id: None,
                    recipient_count: receipt.sent.len().max(1),
                });
                return SendOutcome::ok();
            }

            let reason = receipt.failed[0].reason.clone();
            if TERMINAL_REASONS.contains(&reason.as_str()) {
                if reason == "BadDeviceToken" || reason == "Unregistered" {
                    self.handle_bad_token(token);
                }
                warn!(reason = %reason, "Push delivery failed terminally");
                return SendOutcome::failed(reason);
            }
            debug!(attempt, reason = %reason, "Transient push failure");
        }

        SendOutcome::failed("MaxRetriesExceeded")
    }

    /// Record a permanently undeliverable token and drop every client
    /// registration pointing at it. The bad set only grows.
    pub fn handle_bad_token(&self, token: &str) {
        self.bad_tokens.write().insert(token.to_string());
        self.device_tokens.write().retain(|_, t| t != token);
        info!("Evicted bad push token");
    }

    /// Deliver a payload to one registered client.
    pub async fn send_to_client(&self, client_id: &str, payload: &PushPayload) -> SendOutcome {
        match self.token_for(client_id) {
            Some(token) => self.send(&token, payload).await,
            None => SendOutcome::failed("NoTokenRegistered"),
        }
    }

    /// Fan a payload out to many clients with at most 10 in-flight
    /// sends (the configured cap).
    pub async fn send_to_multiple_clients(
        self: &Arc<Self>,
        client_ids: &[String],
        payload: &PushPayload,
    ) -> FanoutTotals {
        let mut handles = Vec::with_capacity(client_ids.len());
        for client_id in client_ids {
            let notifier = Arc::clone(self);
            let client_id = client_id.clone();
            let payload = payload.clone();
            let semaphore = Arc::clone(&self.fanout);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                notifier.send_to_client(&client_id, &payload).await
            }));
        }

        let mut totals = FanoutTotals::default();
        for handle in handles {
            match handle.await {
                Ok(outcome) if outcome.success => totals.sent += 1,
                _ => totals.failed += 1,
            }
        }
        totals
    }

    /// Notify every registered client that an assistant response landed.
    pub async fn send_response_notification(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        is_long_running: bool,
    ) -> FanoutTotals {
        let kind = if is_long_running {
            NotificationKind::LongRunningCompletion
        } else {
            NotificationKind::Response
        };
        let payload = PushPayload::new("Assistant response", text, kind).with_session(session_id);
        let clients: Vec<String> = self.device_tokens.read().keys().cloned().collect();
        self.send_to_multiple_clients(&clients, &payload).await
    }

    /// Notify every registered client of a failed long task.
    pub async fn send_error_notification(
        self: &Arc<Self>,
        session_id: &str,
        error_text: &str,
    ) -> FanoutTotals {
        let payload = PushPayload::new("Request failed", error_text, NotificationKind::Error)
            .with_session(session_id);
        let clients: Vec<String> = self.device_tokens.read().keys().cloned().collect();
        self.send_to_multiple_clients(&clients, &payload).await
    }

    /// Notify clients that a permission decision is needed.
    pub async fn send_permission_notification(
        self: &Arc<Self>,
        request_id: &str,
        operation: &str,
    ) -> FanoutTotals {
        let payload = PushPayload::new(
            "Permission required",
            operation,
            NotificationKind::PermissionRequest,
        )
        .with_data(serde_json::json!({ "requestId": request_id }));
        let clients: Vec<String> = self.device_tokens.read().keys().cloned().collect();
        let totals = self.send_to_multiple_clients(&clients, &payload).await;
        self.bus.emit(GatewayEvent::NotificationSent {
            request_id: Some(request_id.to_string()),
            recipient_count: totals.sent,
        });
        totals
    }

    /// Shut the provider transport down.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport fake: scripted failure reasons per token, call counting.
    #[derive(Default)]
    pub struct FakePushTransport {
        pub calls: AtomicUsize,
        pub failures: Mutex<HashMap<String, Vec<String>>>,
        pub delivered: Mutex<Vec<(String, PushPayload)>>,
    }

    impl FakePushTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue failure reasons for a token; they are consumed in order,
        /// after which sends succeed.
        pub fn fail_with(&self, token: &str, reasons: &[&str]) {
            self.failures.lock().insert(
                token.to_string(),
                reasons.iter().map(|r| r.to_string()).collect(),
            );
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushTransport for FakePushTransport {
        async fn send(&self, payload: &PushPayload, token: &str) -> TransportReceipt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next_failure = {
                let mut failures = self.failures.lock();
                failures.get_mut(token).and_then(|queue| {
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                })
            };
            match next_failure {
                Some(reason) => TransportReceipt {
                    sent: vec![],
                    failed: vec![FailedDelivery {
                        device: token.to_string(),
                        reason,
                    }],
                },
                None => {
                    self.delivered
                        .lock()
                        .push((token.to_string(), payload.clone()));
                    TransportReceipt {
                        sent: vec![token.to_string()],
                        failed: vec![],
                    }
                }
            }
        }

        async fn shutdown(&self) {}
    }
}
