//! # aicli-gateway
//!
//! Multi-client session gateway for the AICLI command-line assistant.
//! Clients connect over WebSocket, subscribe to sessions, and submit
//! prompts; the gateway supervises one child process per session (via
//! `aicli-runner`), fans typed stream events out to connected clients,
//! buffers them for absent ones, elects a primary device per session,
//! marshals permission decisions, and delivers push notifications.

pub mod api;
pub mod core;
pub mod utils;

pub use crate::api::ws::GatewayState;
pub use crate::core::broadcaster::Broadcaster;
pub use crate::core::config::Settings;
pub use crate::core::connections::{ClientTransport, ConnectionRegistry};
pub use crate::core::devices::DeviceRegistry;
pub use crate::core::events::{EventBus, GatewayEvent};
pub use crate::core::permissions::PermissionManager;
pub use crate::core::push::{PushNotifier, PushPayload, PushTransport};
pub use crate::core::queue::MessageQueue;
pub use crate::core::retry_queue::RetryQueue;
pub use crate::core::sessions::SessionManager;
pub use crate::core::tasks::LongRunningTaskManager;
