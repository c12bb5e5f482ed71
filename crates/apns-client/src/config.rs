//! Configuration for the gateway client.

use crate::error::{GatewayError, GatewayResult};
use apns_queue::{QueueConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RETENTION};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Production gateway.
pub const GATEWAY_ADDRESS: &str = "gateway.push.apple.com:2195";

/// Sandbox gateway.
pub const GATEWAY_ADDRESS_SANDBOX: &str = "gateway.sandbox.push.apple.com:2195";

/// Production feedback service.
pub const FEEDBACK_ADDRESS: &str = "feedback.push.apple.com:2196";

/// Sandbox feedback service.
pub const FEEDBACK_ADDRESS_SANDBOX: &str = "feedback.sandbox.push.apple.com:2196";

/// Gateway client configuration.
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Use the sandbox gateway and feedback service
    pub sandbox: bool,

    /// Gateway address override (host:port)
    pub gateway_address: Option<String>,

    /// Feedback service address override (host:port)
    pub feedback_address: Option<String>,

    /// Largest single frame write in bytes
    pub max_frame_size: usize,

    /// How long sent notifications stay available for resending
    pub cache_retention_secs: u64,

    /// Coalescing wait when the queue runs dry mid-batch
    pub send_delay_ms: u64,

    /// Idle time before a connection is considered dead
    pub read_timeout_ms: u64,

    /// TCP connect timeout
    pub connect_timeout_ms: u64,

    /// Reconnect delay grows by this much per failed attempt
    pub reconnect_step_ms: u64,

    /// Upper bound for the reconnect delay, and the wait before a new
    /// attempt after the driver gave up
    pub reconnect_max_ms: u64,

    /// Consecutive failed connects before the driver gives up for a while
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sandbox: false,
            gateway_address: None,
            feedback_address: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            cache_retention_secs: DEFAULT_RETENTION.as_secs(),
            send_delay_ms: 100,
            read_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            reconnect_step_ms: 10_000,
            reconnect_max_ms: 30 * 60 * 1000,
            max_reconnect_attempts: 10,
        }
    }
}

impl GatewayConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `APNS_*` environment variables.
    pub fn from_env() -> GatewayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GatewayResult<Self> {
        let mut config = Self::default();

        if let Some(sandbox) = lookup("APNS_SANDBOX") {
            config.sandbox = parse_flag("APNS_SANDBOX", &sandbox)?;
        }
        if let Some(addr) = lookup("APNS_GATEWAY_ADDR") {
            config.gateway_address = Some(addr);
        }
        if let Some(addr) = lookup("APNS_FEEDBACK_ADDR") {
            config.feedback_address = Some(addr);
        }
        if let Some(value) = lookup("APNS_SEND_DELAY_MS") {
            config.send_delay_ms = parse_number("APNS_SEND_DELAY_MS", &value)?;
        }
        if let Some(value) = lookup("APNS_MAX_FRAME_SIZE") {
            config.max_frame_size = parse_number("APNS_MAX_FRAME_SIZE", &value)?;
        }
        if let Some(value) = lookup("APNS_CACHE_RETENTION_SECS") {
            config.cache_retention_secs = parse_number("APNS_CACHE_RETENTION_SECS", &value)?;
        }
        if let Some(value) = lookup("APNS_READ_TIMEOUT_MS") {
            config.read_timeout_ms = parse_number("APNS_READ_TIMEOUT_MS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the driver cannot run with.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_frame_size == 0 {
            return Err(GatewayError::Config(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        if self.cache_retention_secs == 0 {
            return Err(GatewayError::Config(
                "cache_retention_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(GatewayError::Config(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Address of the push gateway.
    pub fn gateway_addr(&self) -> &str {
        match (&self.gateway_address, self.sandbox) {
            (Some(addr), _) => addr,
            (None, true) => GATEWAY_ADDRESS_SANDBOX,
            (None, false) => GATEWAY_ADDRESS,
        }
    }

    /// Address of the feedback service.
    pub fn feedback_addr(&self) -> &str {
        match (&self.feedback_address, self.sandbox) {
            (Some(addr), _) => addr,
            (None, true) => FEEDBACK_ADDRESS_SANDBOX,
            (None, false) => FEEDBACK_ADDRESS,
        }
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache_retention_secs)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_step(&self) -> Duration {
        Duration::from_millis(self.reconnect_step_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Queue tunables derived from this config.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_frame_size: self.max_frame_size,
            retention: self.cache_retention(),
            ..Default::default()
        }
    }
}

fn parse_flag(name: &str, value: &str) -> GatewayResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(GatewayError::Config(format!(
            "{} must be a boolean, got {:?}",
            name, other
        ))),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> GatewayResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} must be a number, got {:?}", name, value)))
}
