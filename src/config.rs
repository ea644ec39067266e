// config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::registry::EventFormat;
use crate::webhook::DeliveryGate;

/// Optional config file in the working directory (`relay.toml`, `relay.json`, ...).
const CONFIG_FILE: &str = "relay";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFormatKind {
    #[default]
    Named,
    Raw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub webhook_secret_key: Option<String>,
    pub redis_url: Option<String>,
    pub redis_channel: String,
    pub delivery_gate: DeliveryGate,
    pub event_format: EventFormatKind,
    pub event_name: String,
    pub timestamp_tolerance_secs: Option<u64>,
    pub require_session_id: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 3000,
            webhook_secret_key: None,
            redis_url: None,
            redis_channel: "webhook-relay:events".to_string(),
            delivery_gate: DeliveryGate::Always,
            event_format: EventFormatKind::Named,
            event_name: "status_change".to_string(),
            timestamp_tolerance_secs: None,
            require_session_id: false,
        }
    }
}

impl Config {
    /// Defaults, then `relay.*` if present, then environment variables.
    /// A `.env` file in the working directory is loaded into the environment first.
    pub fn load() -> Result<Self> {
        Self::load_with_env_file(None)
    }

    fn load_with_env_file(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                dotenvy::from_path(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
            }
            None => {
                dotenvy::dotenv().ok();
            }
        }
        Self::from_env(config::Environment::default())
    }

    // Values stay strings until serde asks for a number or bool, so a secret
    // like "007" is not coerced.
    fn from_env(env: config::Environment) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(env)
            .build()
            .context("failed to read configuration")?;

        settings
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret_key.as_deref().filter(|s| !s.is_empty())
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref().filter(|s| !s.is_empty())
    }

    pub fn event_format(&self) -> EventFormat {
        match self.event_format {
            EventFormatKind::Named => EventFormat::Named {
                event: self.event_name.clone(),
            },
            EventFormatKind::Raw => EventFormat::Raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_match_single_instance_relay() {
        let config = from_toml("");
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
        assert_eq!(config.webhook_secret(), None);
        assert_eq!(config.redis_url(), None);
        assert_eq!(config.delivery_gate, DeliveryGate::Always);
        assert_eq!(
            config.event_format(),
            EventFormat::Named {
                event: "status_change".to_string()
            }
        );
        assert!(!config.require_session_id);
        assert_eq!(config.timestamp_tolerance_secs, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_toml(
            r#"
            port = 8080
            webhook_secret_key = "k"
            redis_url = "redis://127.0.0.1/"
            delivery_gate = "decision"
            event_format = "raw"
            timestamp_tolerance_secs = 300
            require_session_id = true
            "#,
        );
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.webhook_secret(), Some("k"));
        assert_eq!(config.redis_url(), Some("redis://127.0.0.1/"));
        assert_eq!(config.delivery_gate, DeliveryGate::Decision);
        assert_eq!(config.event_format(), EventFormat::Raw);
        assert_eq!(config.timestamp_tolerance_secs, Some(300));
        assert!(config.require_session_id);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = from_toml(
            r#"
            webhook_secret_key = ""
            redis_url = ""
            "#,
        );
        assert_eq!(config.webhook_secret(), None);
        assert_eq!(config.redis_url(), None);
    }

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_env(config::Environment::default().source(Some(map))).unwrap()
    }

    #[test]
    fn env_strings_are_kept_verbatim() {
        let config = from_vars(&[
            ("WEBHOOK_SECRET_KEY", "007"),
            ("EVENT_NAME", "1e3"),
            ("REDIS_CHANNEL", "true"),
        ]);
        assert_eq!(config.webhook_secret(), Some("007"));
        assert_eq!(
            config.event_format(),
            EventFormat::Named {
                event: "1e3".to_string()
            }
        );
        assert_eq!(config.redis_channel, "true");
    }

    #[test]
    fn env_numbers_and_flags_still_parse() {
        let config = from_vars(&[
            ("PORT", "8080"),
            ("TIMESTAMP_TOLERANCE_SECS", "300"),
            ("REQUIRE_SESSION_ID", "true"),
            ("DELIVERY_GATE", "decision"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.timestamp_tolerance_secs, Some(300));
        assert!(config.require_session_id);
        assert_eq!(config.delivery_gate, DeliveryGate::Decision);
    }

    #[test]
    fn env_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("relay-{}.env", uuid::Uuid::new_v4()));
        std::fs::write(&path, "RELAY_DOTENV_CHECK=from-file\n").unwrap();

        Config::load_with_env_file(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(std::env::var("RELAY_DOTENV_CHECK").unwrap(), "from-file");
    }

    #[test]
    fn named_env_file_must_exist() {
        let path = std::env::temp_dir().join(format!("relay-{}.env", uuid::Uuid::new_v4()));
        assert!(Config::load_with_env_file(Some(&path)).is_err());
    }
}
