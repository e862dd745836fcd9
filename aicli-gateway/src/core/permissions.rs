//! Permission manager
//!
//! Marshals out-of-band approve/deny decisions for operations the
//! assistant wants to perform. Requests resolve through explicit
//! decisions, configured auto-rules, history-driven learning, or a
//! timeout that applies the configured default action. Completed
//! requests land in a bounded history ring.

use crate::core::events::{EventBus, GatewayEvent};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Approver name recorded when a timeout applies the default action
pub const TIMEOUT_APPROVER: &str = "timeout-default";

/// What happens when a request times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Approve,
    Deny,
}

impl DefaultAction {
    pub fn from_str_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("approve") {
            Self::Approve
        } else {
            Self::Deny
        }
    }
}

/// Tunable thresholds and timeouts.
#[derive(Debug, Clone)]
pub struct PermissionSettings {
    pub request_timeout: Duration,
    pub default_action: DefaultAction,
    /// Uninterrupted approvals before an operation auto-approves
    pub auto_approve_threshold: usize,
    /// Total denials before an operation auto-denies
    pub auto_deny_threshold: usize,
    /// History ring capacity
    pub history_cap: usize,
    /// Size the ring is trimmed to on overflow
    pub history_trim: usize,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            default_action: DefaultAction::Deny,
            auto_approve_threshold: 5,
            auto_deny_threshold: 3,
            history_cap: 1000,
            history_trim: 500,
        }
    }
}

/// Lifecycle of one request. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

/// One permission request, pending or completed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub operation: String,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PermissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Resolution handed back to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub approved: bool,
    pub request_id: Option<String>,
    pub approver: Option<String>,
    pub denier: Option<String>,
    pub reason: Option<String>,
    pub auto: bool,
}

/// A configured auto-rule: exact substring or regex.
#[derive(Debug, Clone)]
pub enum AutoRule {
    Substring(String),
    Pattern(Regex),
}

impl AutoRule {
    fn matches(&self, operation: &str) -> bool {
        match self {
            Self::Substring(s) => operation.contains(s.as_str()),
            Self::Pattern(re) => re.is_match(operation),
        }
    }
}

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub operation: Option<String>,
    pub status: Option<PermissionStatus>,
    pub limit: Option<usize>,
}

/// Seam through which pending requests reach the outside world. The
/// default implementation fans out via the push notifier.
#[async_trait]
pub trait PermissionNotifier: Send + Sync {
    async fn notify(&self, request: &PermissionRequest);
}

/// Notifier that does nothing; used when no push stack is wired.
pub struct NullPermissionNotifier;

#[async_trait]
impl PermissionNotifier for NullPermissionNotifier {
    async fn notify(&self, _request: &PermissionRequest) {}
}

/// Default notifier: pushes to registered devices.
pub struct PushPermissionNotifier {
    notifier: Arc<crate::core::push::PushNotifier>,
}

impl PushPermissionNotifier {
    pub fn new(notifier: Arc<crate::core::push::PushNotifier>) -> Arc<Self> {
        Arc::new(Self { notifier })
    }
}

#[async_trait]
impl PermissionNotifier for PushPermissionNotifier {
    async fn notify(&self, request: &PermissionRequest) {
        self.notifier
            .send_permission_notification(&request.id, &request.operation)
            .await;
    }
}

struct PendingEntry {
    request: PermissionRequest,
    resolver: oneshot::Sender<PermissionDecision>,
}

/// Permission manager with timeout, auto-rules, and learned decisions.
pub struct PermissionManager {
    settings: PermissionSettings,
    auto_approve: RwLock<Vec<AutoRule>>,
    auto_deny: RwLock<Vec<AutoRule>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    history: Mutex<VecDeque<PermissionRequest>>,
    notifier: Arc<dyn PermissionNotifier>,
    bus: EventBus,
}

impl PermissionManager {
    pub fn new(
        settings: PermissionSettings,
        notifier: Arc<dyn PermissionNotifier>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            auto_approve: RwLock::new(Vec::new()),
            auto_deny: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            notifier,
            bus,
        })
    }

    pub fn add_auto_approve_rule(&self, rule: AutoRule) {
        self.auto_approve.write().push(rule);
    }

    pub fn add_auto_deny_rule(&self, rule: AutoRule) {
        self.auto_deny.write().push(rule);
    }

    /// Request permission for an operation.
    ///
    /// Resolution order: auto-approve rules and learned approvals, then
    /// auto-deny rules and learned denials, then a live request that
    /// waits for an explicit decision or times out into the default
    /// action.
    pub async fn request_permission(&self, operation: &str, context: Value) -> PermissionDecision {
        let now = Utc::now();

        if self.matches_auto_approve(operation) {
            debug!(operation, "Auto-approved");
            self.record_auto(operation, &context, now, true);
            return PermissionDecision {
                approved: true,
                request_id: None,
                approver: Some("auto".to_string()),
                denier: None,
                reason: None,
                auto: true,
            };
        }

        if self.matches_auto_deny(operation) {
            debug!(operation, "Auto-denied");
            let reason = "operation matches an auto-deny rule or denial history".to_string();
            self.record_auto(operation, &context, now, false);
            return PermissionDecision {
                approved: false,
                request_id: None,
                approver: None,
                denier: Some("auto".to_string()),
                reason: Some(reason),
                auto: true,
            };
        }

        let id = format!("perm_{}", Uuid::new_v4());
        let timeout = self.settings.request_timeout;
        let request = PermissionRequest {
            id: id.clone(),
            operation: operation.to_string(),
            context,
            created_at: now,
            expires_at: now
                + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(300)),
            status: PermissionStatus::Pending,
            approver: None,
            denier: None,
            reason: None,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingEntry {
                request: request.clone(),
                resolver: tx,
            },
        );

        info!(request_id = %id, operation, "Permission requested");
        self.notifier.notify(&request).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) | Err(_) => self.resolve_timeout(&id),
        }
    }

    fn resolve_timeout(&self, request_id: &str) -> PermissionDecision {
        let entry = self.pending.lock().remove(request_id);
        let approved = self.settings.default_action == DefaultAction::Approve;
        let reason = format!(
            "Request timed out after {} seconds",
            self.settings.request_timeout.as_secs()
        );

        if let Some(mut entry) = entry {
            entry.request.status = PermissionStatus::TimedOut;
            entry.request.approver = Some(TIMEOUT_APPROVER.to_string());
            entry.request.reason = Some(reason.clone());
            self.log_history(entry.request);
        }

        warn!(request_id, approved, "Permission request timed out");
        PermissionDecision {
            approved,
            request_id: Some(request_id.to_string()),
            approver: Some(TIMEOUT_APPROVER.to_string()),
            denier: None,
            reason: Some(reason),
            auto: false,
        }
    }

    /// Approve a pending request. Returns `false` for unknown or
    /// non-pending ids.
    pub fn approve_request(&self, request_id: &str, approver: Option<&str>) -> bool {
        let Some(mut entry) = self.pending.lock().remove(request_id) else {
            return false;
        };
        let approver = approver.unwrap_or("user").to_string();
        entry.request.status = PermissionStatus::Approved;
        entry.request.approver = Some(approver.clone());

        let request_json = serde_json::to_value(&entry.request).unwrap_or(Value::Null);
        self.log_history(entry.request);
        self.bus.emit(GatewayEvent::PermissionApproved {
            request: request_json,
        });

        let _ = entry.resolver.send(PermissionDecision {
            approved: true,
            request_id: Some(request_id.to_string()),
            approver: Some(approver),
            denier: None,
            reason: None,
            auto: false,
        });
        true
    }

    /// Deny a pending request. Returns `false` for unknown or
    /// non-pending ids.
    pub fn deny_request(&self, request_id: &str, reason: Option<&str>, denier: Option<&str>) -> bool {
        let Some(mut entry) = self.pending.lock().remove(request_id) else {
            return false;
        };
        let denier = denier.unwrap_or("user").to_string();
        entry.request.status = PermissionStatus::Denied;
        entry.request.denier = Some(denier.clone());
        entry.request.reason = reason.map(str::to_string);

        let request_json = serde_json::to_value(&entry.request).unwrap_or(Value::Null);
        self.log_history(entry.request);
        self.bus.emit(GatewayEvent::PermissionDenied {
            request: request_json,
        });

        let _ = entry.resolver.send(PermissionDecision {
            approved: false,
            request_id: Some(request_id.to_string()),
            approver: None,
            denier: Some(denier),
            reason: reason.map(str::to_string),
            auto: false,
        });
        true
    }

    fn matches_auto_approve(&self, operation: &str) -> bool {
        if self.auto_approve.read().iter().any(|r| r.matches(operation)) {
            return true;
        }
        self.uninterrupted_approvals(operation) >= self.settings.auto_approve_threshold
    }

    fn matches_auto_deny(&self, operation: &str) -> bool {
        if self.auto_deny.read().iter().any(|r| r.matches(operation)) {
            return true;
        }
        self.denial_count(operation) >= self.settings.auto_deny_threshold
    }

    /// Approvals of this exact operation since its most recent denial.
    fn uninterrupted_approvals(&self, operation: &str) -> usize {
        let history = self.history.lock();
        let mut count = 0;
        for entry in history.iter().rev().filter(|e| e.operation == operation) {
            match entry.status {
                PermissionStatus::Approved => count += 1,
                PermissionStatus::Denied => break,
                _ => {}
            }
        }
        count
    }

    /// Total denials of this exact operation.
    fn denial_count(&self, operation: &str) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|e| e.operation == operation && e.status == PermissionStatus::Denied)
            .count()
    }

    fn record_auto(&self, operation: &str, context: &Value, now: DateTime<Utc>, approved: bool) {
        let request = PermissionRequest {
            id: format!("perm_{}", Uuid::new_v4()),
            operation: operation.to_string(),
            context: context.clone(),
            created_at: now,
            expires_at: now,
            status: if approved {
                PermissionStatus::Approved
            } else {
                PermissionStatus::Denied
            },
            approver: approved.then(|| "auto".to_string()),
            denier: (!approved).then(|| "auto".to_string()),
            reason: None,
        };
        self.log_history(request);
    }

    /// Append a completed request to the history ring. The ring holds at
    /// most `history_cap` entries; an insert that would exceed the cap
    /// trims the ring to `history_trim`.
    pub fn log_history(&self, request: PermissionRequest) {
        let mut history = self.history.lock();
        if history.len() + 1 > self.settings.history_cap {
            let excess = history.len() + 1 - self.settings.history_trim;
            let trim_to = excess.min(history.len());
            history.drain(..trim_to);
        }
        history.push_back(request);
    }

    /// Completed requests, newest first, optionally filtered.
    pub fn get_approval_history(&self, filter: HistoryFilter) -> Vec<PermissionRequest> {
        let history = self.history.lock();
        let iter = history
            .iter()
            .rev()
            .filter(|e| {
                filter
                    .operation
                    .as_deref()
                    .map(|op| e.operation == op)
                    .unwrap_or(true)
            })
            .filter(|e| filter.status.map(|s| e.status == s).unwrap_or(true))
            .cloned();
        match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Empty the history and return how many entries were removed.
    pub fn clear_history(&self) -> usize {
        let mut history = self.history.lock();
        let count = history.len();
        history.clear();
        count
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PermissionNotifier for CountingNotifier {
        async fn notify(&self, _request: &PermissionRequest) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager_with(
        settings: PermissionSettings,
    ) -> (Arc<PermissionManager>, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
        });
        let manager = PermissionManager::new(settings, notifier.clone(), EventBus::new());
        (manager, notifier)
    }

    fn completed(operation: &str, status: PermissionStatus) -> PermissionRequest {
        let now = Utc::now();
        PermissionRequest {
            id: format!("perm_{}", Uuid::new_v4()),
            operation: operation.to_string(),
            context: Value::Null,
            created_at: now,
            expires_at: now,
            status,
            approver: None,
            denier: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_auto_approve_rule() {
        let (manager, notifier) = manager_with(PermissionSettings::default());
        manager.add_auto_approve_rule(AutoRule::Substring("read file".into()));

        let decision = manager.request_permission("read file src/main.rs", json!({})).await;
        assert!(decision.approved);
        assert!(decision.auto);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_deny_regex_rule() {
        let (manager, _) = manager_with(PermissionSettings::default());
        manager.add_auto_deny_rule(AutoRule::Pattern(Regex::new(r"rm\s+-rf").unwrap()));

        let decision = manager.request_permission("rm  -rf /", json!({})).await;
        assert!(!decision.approved);
        assert!(decision.auto);
        assert!(decision.reason.is_some());
    }

    #[tokio::test]
    async fn test_history_driven_auto_approve() {
        let (manager, notifier) = manager_with(PermissionSettings::default());
        for _ in 0..5 {
            manager.log_history(completed("routine backup", PermissionStatus::Approved));
        }

        let decision = manager.request_permission("routine backup", json!({})).await;
        assert!(decision.approved);
        assert!(decision.auto);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denial_interrupts_learned_approvals() {
        let settings = PermissionSettings {
            request_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (manager, notifier) = manager_with(settings);
        for _ in 0..5 {
            manager.log_history(completed("deploy", PermissionStatus::Approved));
        }
        manager.log_history(completed("deploy", PermissionStatus::Denied));

        // Not auto-approved: the denial resets the streak. It falls
        // through to a live request that times out into a denial.
        let decision = manager.request_permission("deploy", json!({})).await;
        assert!(!decision.approved);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_driven_auto_deny() {
        let (manager, _) = manager_with(PermissionSettings::default());
        for _ in 0..3 {
            manager.log_history(completed("wipe disk", PermissionStatus::Denied));
        }
        let decision = manager.request_permission("wipe disk", json!({})).await;
        assert!(!decision.approved);
        assert!(decision.auto);
    }

    #[tokio::test]
    async fn test_explicit_approval() {
        let settings = PermissionSettings {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (manager, notifier) = manager_with(settings);

        let m = manager.clone();
        let approver = tokio::spawn(async move {
            // Wait until the request is pending, then approve it.
            loop {
                let pending: Vec<String> = m.pending.lock().keys().cloned().collect();
                if let Some(id) = pending.first() {
                    assert!(m.approve_request(id, Some("alice")));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let decision = manager.request_permission("deploy staging", json!({})).await;
        approver.await.unwrap();

        assert!(decision.approved);
        assert!(!decision.auto);
        assert_eq!(decision.approver.as_deref(), Some("alice"));
        assert!(decision.request_id.unwrap().starts_with("perm_"));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.history_len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_denial() {
        let settings = PermissionSettings {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (manager, _) = manager_with(settings);

        let m = manager.clone();
        tokio::spawn(async move {
            loop {
                let pending: Vec<String> = m.pending.lock().keys().cloned().collect();
                if let Some(id) = pending.first() {
                    assert!(m.deny_request(id, Some("too risky"), Some("bob")));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let decision = manager.request_permission("drop table", json!({})).await;
        assert!(!decision.approved);
        assert_eq!(decision.denier.as_deref(), Some("bob"));
        assert_eq!(decision.reason.as_deref(), Some("too risky"));
    }

    #[tokio::test]
    async fn test_timeout_applies_default_action() {
        let settings = PermissionSettings {
            request_timeout: Duration::from_millis(20),
            default_action: DefaultAction::Approve,
            ..Default::default()
        };
        let (manager, _) = manager_with(settings);

        let decision = manager.request_permission("slow op", json!({})).await;
        assert!(decision.approved);
        assert_eq!(decision.approver.as_deref(), Some(TIMEOUT_APPROVER));
        assert!(decision.reason.unwrap().contains("timed out"));

        let history = manager.get_approval_history(HistoryFilter::default());
        assert_eq!(history[0].status, PermissionStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_unknown_request_decisions_return_false() {
        let (manager, _) = manager_with(PermissionSettings::default());
        assert!(!manager.approve_request("perm_missing", None));
        assert!(!manager.deny_request("perm_missing", None, None));
    }

    #[test]
    fn test_history_ring_trims() {
        let settings = PermissionSettings {
            history_cap: 1000,
            history_trim: 500,
            ..Default::default()
        };
        let (manager, _) = manager_with(settings);

        for _ in 0..1000 {
            manager.log_history(completed("op", PermissionStatus::Approved));
        }
        assert_eq!(manager.history_len(), 1000);

        manager.log_history(completed("op", PermissionStatus::Approved));
        assert_eq!(manager.history_len(), 500);
    }

    #[test]
    fn test_history_query_filters_and_order() {
        let (manager, _) = manager_with(PermissionSettings::default());
        manager.log_history(completed("a", PermissionStatus::Approved));
        manager.log_history(completed("b", PermissionStatus::Denied));
        manager.log_history(completed("a", PermissionStatus::Denied));

        let all = manager.get_approval_history(HistoryFilter::default());
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].operation, "a");
        assert_eq!(all[0].status, PermissionStatus::Denied);

        let only_a = manager.get_approval_history(HistoryFilter {
            operation: Some("a".into()),
            ..Default::default()
        });
        assert_eq!(only_a.len(), 2);

        let denied = manager.get_approval_history(HistoryFilter {
            status: Some(PermissionStatus::Denied),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);

        assert_eq!(manager.clear_history(), 3);
        assert_eq!(manager.history_len(), 0);
    }
}
