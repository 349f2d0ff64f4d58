//! Engine-wide settings.
//!
//! Every field has a default, so hosts only send the values they want to
//! change: `EngineConfig::from_json("{}")` is the default configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Timeout for descriptors that do not set one.
    pub default_timeout_secs: u32,
    /// Coalescing interval for descriptors that do not set one.
    pub min_notification_interval_ms: u64,
    /// Sleep between pumps inside `pump_until`.
    pub pump_interval_ms: u64,
    /// How long shutdown waits for aborted exchanges to close.
    pub shutdown_drain_ms: u64,
    /// Capacity of each operation's receive buffer.
    pub receive_buffer_size: usize,
    /// Largest upload chunk read between progress announcements.
    pub upload_chunk_size: usize,
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            min_notification_interval_ms: 1000,
            pump_interval_ms: 10,
            shutdown_drain_ms: 5000,
            receive_buffer_size: 256 * 1024,
            upload_chunk_size: 256 * 1024,
            user_agent: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.shutdown_drain(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config =
            EngineConfig::from_json(r#"{"pumpIntervalMs": 1, "userAgent": "demo/1.0"}"#).unwrap();
        assert_eq!(config.pump_interval_ms, 1);
        assert_eq!(config.user_agent.as_deref(), Some("demo/1.0"));
        assert_eq!(config.default_timeout_secs, 30);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = EngineConfig::from_json(r#"{"pumpIntervalMs": "soon"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
