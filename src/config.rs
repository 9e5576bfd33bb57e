// Конфигурация ядра консультаций
// Логирование можно отключить только в режиме разработки

use crate::peer::types::ServerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Настройки сеанса: тайм-ауты, бюджеты повторов, ICE серверы
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    /// Сколько ждём answer на offer
    pub signaling_timeout_ms: u64,
    /// Полных повторов рукопожатия после тайм-аута
    pub handshake_retries: u32,
    /// ICE restart'ов после потери пути
    pub max_ice_restarts: u32,
    /// Период ожидания перед тем как считать Disconnected провалом
    pub grace_period_ms: u64,
    /// Ёмкость внутренней очереди событий контроллера
    pub event_queue_capacity: usize,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            signaling_timeout_ms: 10_000,
            handshake_retries: 1,
            max_ice_restarts: 2,
            grace_period_ms: 10_000,
            event_queue_capacity: 64,
            ice_servers: default_ice_servers(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig =
            toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "signaling_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity must be greater than zero".into(),
            ));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Дефолтные публичные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CoreConfig::from_toml_str("signaling_timeout_ms = 2500\n").expect("parse");
        assert_eq!(config.signaling_timeout(), Duration::from_millis(2500));
        assert_eq!(config.max_ice_restarts, 2);
        assert_eq!(config.handshake_retries, 1);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"
            [[ice_servers]]
            id = "relay"
            type = "turn"
            url = "turn.example.org:3478"
        "#;
        let err = CoreConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_queue_is_rejected() {
        let err = CoreConfig::from_toml_str("event_queue_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
