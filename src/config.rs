// Session configuration.
// Log verbosity follows the build profile: debug builds log everything,
// release builds keep only warnings and errors unless RUST_LOG says otherwise.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// ICE server entry as supplied by the host application.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// Bounded exponential backoff for the signaling link.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// the attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the signaling relay.
    pub signaling_url: String,
    pub ice_servers: Vec<ServerConfig>,
    /// Hard ceiling for reaching the `active` phase.
    pub init_timeout_ms: u64,
    /// How long a `disconnected` transport may stay down before an ICE restart.
    pub grace_period_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/ws".into(),
            ice_servers: default_ice_servers(),
            init_timeout_ms: 15_000,
            grace_period_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MEETMESH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("MEETMESH_SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Ok(timeout) = std::env::var("MEETMESH_INIT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse() {
                config.init_timeout_ms = val;
            }
        }

        if let Ok(attempts) = std::env::var("MEETMESH_RECONNECT_ATTEMPTS") {
            if let Ok(val) = attempts.parse() {
                config.reconnect.max_attempts = val;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_url.trim().is_empty() {
            return Err(ConfigError::Invalid("signaling_url cannot be empty".into()));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server '{}' has an empty URL",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }

        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be > 0".into(),
            ));
        }

        if self.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid("init_timeout_ms must be > 0".into()));
        }

        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        };
        let delays: Vec<_> = (1..=6)
            .map(|n| policy.next_delay(n).map(|d| d.as_millis()))
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(500),
                Some(1_000),
                Some(2_000),
                Some(4_000),
                Some(4_000),
                Some(4_000)
            ]
        );
        assert_eq!(policy.next_delay(7), None);
        assert_eq!(policy.next_delay(0), None);
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let policy = ReconnectPolicy {
            max_attempts: u32::MAX,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        };
        assert_eq!(policy.next_delay(200), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"signaling_url":"ws://relay:9000","reconnect":{"max_attempts":2}}"#)
                .unwrap();
        assert_eq!(config.signaling_url, "ws://relay:9000");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        assert_eq!(config.ice_servers, default_ice_servers());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut config = Config::default();
        config.ice_servers.push(ServerConfig {
            id: "turn".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = Config::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
