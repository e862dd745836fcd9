use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aicli_gateway::api::ws::{self, GatewayState};
use aicli_gateway::core::{
    broadcaster::Broadcaster,
    config::Settings,
    connections::ConnectionRegistry,
    devices::DeviceRegistry,
    events::EventBus,
    permissions::{
        DefaultAction, PermissionManager, PermissionSettings, PushPermissionNotifier,
    },
    push::{LoggingPushTransport, PushNotifier},
    queue::MessageQueue,
    sessions::SessionManager,
    tasks::{HeuristicEstimator, LongRunningTaskManager, TaskManagerConfig},
};
use aicli_runner::AiCliRunner;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new()?;

    info!(
        "Starting AICLI session gateway on {}:{}",
        settings.server.host, settings.server.port
    );

    let app = create_app(settings.clone()).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Gateway listening on ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn create_app(settings: Settings) -> Result<Router> {
    let bus = EventBus::new();

    let registry = ConnectionRegistry::new(settings.auth.token.clone(), bus.clone());
    let queue = MessageQueue::new(settings.queue.ttl_hours as i64, bus.clone());
    let devices = DeviceRegistry::new(
        Duration::from_secs(settings.devices.device_timeout_secs),
        bus.clone(),
    );

    let notifier = PushNotifier::new(
        Arc::new(LoggingPushTransport),
        settings.push.retries,
        settings.push.max_concurrent,
        bus.clone(),
    );

    let permissions = PermissionManager::new(
        PermissionSettings {
            request_timeout: Duration::from_secs(settings.permissions.request_timeout_secs),
            default_action: DefaultAction::from_str_lossy(&settings.permissions.default_action),
            auto_approve_threshold: settings.permissions.auto_approve_threshold,
            auto_deny_threshold: settings.permissions.auto_deny_threshold,
            history_cap: settings.permissions.history_cap,
            history_trim: settings.permissions.history_trim,
        },
        PushPermissionNotifier::new(notifier.clone()),
        bus.clone(),
    );

    let runner = Arc::new(AiCliRunner::discover().await);
    info!("Using AICLI command: {}", runner.command());

    let tasks = LongRunningTaskManager::new(
        TaskManagerConfig {
            long_threshold_ms: settings.tasks.long_threshold_ms,
            heartbeat: Duration::from_secs(settings.tasks.heartbeat_secs),
        },
        Arc::new(HeuristicEstimator),
        runner.events_sender(),
        notifier.clone(),
    );

    let broadcaster = Broadcaster::new(registry.clone(), queue.clone(), bus.clone());
    broadcaster.start(runner.subscribe());

    if settings.timers.enabled {
        registry.start_health_monitoring(Duration::from_secs(
            settings.connections.ping_interval_secs,
        ));
        queue.start_cleanup_timer(Duration::from_secs(settings.queue.cleanup_interval_secs));
        devices.start_timeout_monitor(Duration::from_secs(
            settings.devices.heartbeat_interval_secs,
        ));
    }

    let state = Arc::new(GatewayState {
        registry,
        queue,
        sessions: SessionManager::new(),
        devices,
        permissions,
        tasks,
        runner,
        notifier,
    });

    Ok(ws::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}
