use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub connections: ConnectionConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AuthConfig {
    /// Shared bearer token; `None` disables authentication
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    pub ttl_hours: u64,
    /// `memory` or `redis`; only `memory` is implemented
    pub storage: String,
    pub cleanup_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            storage: "memory".to_string(),
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub device_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_timeout_secs: 300,
            heartbeat_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PermissionConfig {
    pub request_timeout_secs: u64,
    /// `approve` or `deny`
    pub default_action: String,
    pub auto_approve_threshold: usize,
    pub auto_deny_threshold: usize,
    pub history_cap: usize,
    pub history_trim: usize,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            default_action: "deny".to_string(),
            auto_approve_threshold: 5,
            auto_deny_threshold: 3,
            history_cap: 1000,
            history_trim: 500,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PushConfig {
    pub retries: u32,
    pub max_concurrent: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            max_concurrent: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskConfig {
    pub long_threshold_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            long_threshold_ms: 300_000,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    pub ping_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimerConfig {
    /// Master switch for background intervals; forced off in test runs
    pub enabled: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("auth.token", None::<String>)?
            .set_default("queue.ttl_hours", 24)?
            .set_default("queue.storage", "memory")?
            .set_default("queue.cleanup_interval_secs", 3600)?
            .set_default("devices.device_timeout_secs", 300)?
            .set_default("devices.heartbeat_interval_secs", 60)?
            .set_default("permissions.request_timeout_secs", 300)?
            .set_default("permissions.default_action", "deny")?
            .set_default("permissions.auto_approve_threshold", 5)?
            .set_default("permissions.auto_deny_threshold", 3)?
            .set_default("permissions.history_cap", 1000)?
            .set_default("permissions.history_trim", 500)?
            .set_default("push.retries", 3)?
            .set_default("push.max_concurrent", 10)?
            .set_default("tasks.long_threshold_ms", 300_000)?
            .set_default("tasks.heartbeat_secs", 30)?
            .set_default("connections.ping_interval_secs", 30)?
            .set_default("timers.enabled", true)?
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("AICLI_GATEWAY").separator("__"))
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;

        if !matches!(settings.queue.storage.as_str(), "memory" | "redis") {
            return Err(ConfigError::Message(format!(
                "queue.storage must be 'memory' or 'redis', got '{}'",
                settings.queue.storage
            )));
        }
        if !matches!(settings.permissions.default_action.as_str(), "approve" | "deny") {
            return Err(ConfigError::Message(format!(
                "permissions.default_action must be 'approve' or 'deny', got '{}'",
                settings.permissions.default_action
            )));
        }

        // Test runs never create background intervals.
        if cfg!(test) || run_mode == "test" || aicli_runner::is_test_environment() {
            settings.timers.enabled = false;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::new().unwrap();
        assert_eq!(settings.queue.ttl_hours, 24);
        assert_eq!(settings.permissions.auto_approve_threshold, 5);
        assert_eq!(settings.permissions.auto_deny_threshold, 3);
        assert_eq!(settings.push.max_concurrent, 10);
        assert_eq!(settings.tasks.long_threshold_ms, 300_000);
    }

    #[test]
    fn test_timers_forced_off_in_tests() {
        let settings = Settings::new().unwrap();
        assert!(!settings.timers.enabled);
    }
}
