//! Classroom session configuration.
//!
//! Configuration is loaded from environment variables. The auth token is
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default region hint passed to the media engine.
pub const DEFAULT_REGION: &str = "global";

/// Default guard for a single control-plane call in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Default session executor mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 500;

/// Session configuration shared by every session a factory creates.
#[derive(Clone)]
pub struct SessionConfig {
    /// Program/app identifier sent with every control-plane call.
    pub app_id: String,

    /// Already-issued auth token for the control plane.
    /// Protected by `SecretString` to prevent accidental logging.
    pub auth_token: SecretString,

    /// Region hint for media connections (default: "global").
    pub region: String,

    /// Whether the camera stream reuses the session-wide media connection.
    pub reuse_default_connection: bool,

    /// Guard after which an in-flight control-plane call is failed as a timeout.
    pub operation_timeout: Duration,

    /// Session executor mailbox capacity.
    pub mailbox_capacity: usize,

    /// Subscribe remote streams automatically as they appear.
    pub auto_subscribe: bool,
}

/// Custom Debug implementation that redacts the auth token.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("app_id", &self.app_id)
            .field("auth_token", &"[REDACTED]")
            .field("region", &self.region)
            .field("reuse_default_connection", &self.reuse_default_connection)
            .field("operation_timeout", &self.operation_timeout)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("auto_subscribe", &self.auto_subscribe)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let app_id = vars
            .get("CLASSROOM_APP_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("CLASSROOM_APP_ID".to_string()))?
            .clone();

        let auth_token = SecretString::from(
            vars.get("CLASSROOM_AUTH_TOKEN")
                .ok_or_else(|| ConfigError::MissingEnvVar("CLASSROOM_AUTH_TOKEN".to_string()))?
                .clone(),
        );

        let region = vars
            .get("CLASSROOM_REGION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let reuse_default_connection = vars
            .get("CLASSROOM_REUSE_DEFAULT_CONNECTION")
            .and_then(|s| parse_bool(s))
            .unwrap_or(true);

        let auto_subscribe = vars
            .get("CLASSROOM_AUTO_SUBSCRIBE")
            .and_then(|s| parse_bool(s))
            .unwrap_or(false);

        let timeout_ms = vars
            .get("CLASSROOM_OPERATION_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CLASSROOM_OPERATION_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let mailbox_capacity = vars
            .get("CLASSROOM_MAILBOX_CAPACITY")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAILBOX_CAPACITY);
        if mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "CLASSROOM_MAILBOX_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(SessionConfig {
            app_id,
            auth_token,
            region,
            reuse_default_connection,
            operation_timeout: Duration::from_millis(timeout_ms),
            mailbox_capacity,
            auto_subscribe,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
