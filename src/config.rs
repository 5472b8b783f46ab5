//! Configuration loader and validator for the activity relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Top-level configuration, deserialized 1:1 from the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub publisher: Publisher,
    pub broker: Broker,
    pub validator: Validator,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Outbox publisher loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publisher {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub max_in_flight: u32,
    pub lease_seconds: u32,
    pub base_backoff_seconds: u32,
    pub max_backoff_seconds: u32,
    pub max_attempts: u32,
}

/// Message broker settings (RabbitMQ management API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub api_url: String,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub routing_key: String,
    pub publish_timeout_ms: u64,
}

/// User validation service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validator {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Config {
    /// Create `app.data_dir` if it does not exist yet.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Read and validate a YAML config file. Without an explicit `path` this
/// looks for `config.yaml` in the working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.publisher.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("publisher.poll_interval_ms must be > 0"));
    }
    if cfg.publisher.batch_size == 0 {
        return Err(ConfigError::Invalid("publisher.batch_size must be > 0"));
    }
    if cfg.publisher.max_in_flight == 0 {
        return Err(ConfigError::Invalid("publisher.max_in_flight must be > 0"));
    }
    if cfg.publisher.lease_seconds == 0 {
        return Err(ConfigError::Invalid("publisher.lease_seconds must be > 0"));
    }
    if cfg.publisher.base_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("publisher.base_backoff_seconds must be > 0"));
    }
    if cfg.publisher.max_backoff_seconds < cfg.publisher.base_backoff_seconds {
        return Err(ConfigError::Invalid(
            "publisher.max_backoff_seconds must be >= base_backoff_seconds",
        ));
    }
    if cfg.publisher.max_attempts == 0 {
        return Err(ConfigError::Invalid("publisher.max_attempts must be > 0"));
    }

    if cfg.broker.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.api_url must be non-empty"));
    }
    if cfg.broker.vhost.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.vhost must be non-empty"));
    }
    if cfg.broker.username.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.username must be non-empty"));
    }
    if cfg.broker.password.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.password must be non-empty"));
    }
    if cfg.broker.exchange.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.exchange must be non-empty"));
    }
    if cfg.broker.routing_key.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.routing_key must be non-empty"));
    }
    if cfg.broker.publish_timeout_ms == 0 {
        return Err(ConfigError::Invalid("broker.publish_timeout_ms must be > 0"));
    }

    if cfg.validator.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("validator.base_url must be non-empty"));
    }
    if cfg.validator.timeout_ms == 0 {
        return Err(ConfigError::Invalid("validator.timeout_ms must be > 0"));
    }

    Ok(())
}

/// Canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

publisher:
  poll_interval_ms: 500
  batch_size: 16
  max_in_flight: 4
  lease_seconds: 30
  base_backoff_seconds: 5
  max_backoff_seconds: 3600
  max_attempts: 8

broker:
  api_url: "http://localhost:15672"
  vhost: "/"
  username: "guest"
  password: "guest"
  exchange: "fitness.exchange"
  routing_key: "activity.tracking"
  publish_timeout_ms: 10000

validator:
  base_url: "http://localhost:8081"
  timeout_ms: 3000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_publisher_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publisher.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publisher.max_backoff_seconds = 1;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_backoff_seconds")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publisher.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_broker_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.exchange = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("broker.exchange")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.routing_key = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.username = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_validator_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.validator.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("validator.base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.validator.timeout_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.broker.exchange, "fitness.exchange");
        assert_eq!(cfg.publisher.max_attempts, 8);
    }
}
