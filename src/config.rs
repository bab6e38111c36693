// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Configuration consumed by the tap and the replay engine. Every type
//! deserializes with serde, so it can be loaded from a JSON file with
//! [`load_json`] or assembled by a command line front end.

use crate::{errors::AmqpError, message::Headers};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, str::FromStr, time::Duration};

/// Binding key used when an exchange is given without one.
pub const DEFAULT_BINDING_KEY: &str = "#";

/// Identifies one exchange to tap and the binding pattern to mirror.
///
/// The binding key depends on the type of the tapped exchange:
/// `#` on topic exchanges, an exact key on direct exchanges and an empty key
/// on fanout or headers exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfiguration {
    pub exchange: String,
    #[serde(default)]
    pub binding_key: String,
}

impl ExchangeConfiguration {
    pub fn new(exchange: &str, binding_key: &str) -> Self {
        ExchangeConfiguration {
            exchange: exchange.to_owned(),
            binding_key: binding_key.to_owned(),
        }
    }
}

impl FromStr for ExchangeConfiguration {
    type Err = AmqpError;

    /// Parses `exchange:bindingkey`. Without a colon the binding key is `#`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (exchange, binding_key) = s.split_once(':').unwrap_or((s, DEFAULT_BINDING_KEY));

        if exchange.is_empty() {
            return Err(AmqpError::InvalidConfiguration(format!(
                "missing exchange name in `{s}`"
            )));
        }

        Ok(ExchangeConfiguration::new(exchange, binding_key))
    }
}

/// One broker and the exchanges to tap there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfiguration {
    pub amqp_url: String,
    pub exchanges: Vec<ExchangeConfiguration>,
}

/// Backoff policy of the redial loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedialConfig {
    /// Give up if the very first dial fails.
    pub fail_early: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed dials before giving up; unlimited if absent.
    pub max_attempts: Option<u32>,
}

impl Default for RedialConfig {
    fn default() -> Self {
        RedialConfig {
            fail_early: true,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl RedialConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }
}

/// Options shared by every tapped broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapOptions {
    pub connection_name: String,
    /// Stop when no message arrived for this long.
    pub idle_timeout_ms: Option<u64>,
    /// Stop after this many accepted messages.
    pub limit: Option<u64>,
    pub redial: RedialConfig,
}

impl Default for TapOptions {
    fn default() -> Self {
        TapOptions {
            connection_name: "amqp-tap".to_owned(),
            idle_timeout_ms: None,
            limit: None,
            redial: RedialConfig::default(),
        }
    }
}

impl TapOptions {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Timing and routing overrides applied when replaying captured messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub amqp_url: String,
    pub connection_name: String,
    /// Exchange override; `Some("")` targets the default exchange.
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Header override, used when non-empty.
    pub headers: Headers,
    /// Fixed delay between messages, replacing the captured pacing.
    pub fixed_delay_ms: Option<u64>,
    /// Scale factor applied to the captured pacing.
    pub speed: f64,
    pub redial: RedialConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            amqp_url: String::new(),
            connection_name: "amqp-tap-replay".to_owned(),
            exchange: None,
            routing_key: None,
            headers: Headers::new(),
            fixed_delay_ms: None,
            speed: 1.0,
            redial: RedialConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn fixed_delay(&self) -> Option<Duration> {
        self.fixed_delay_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(AmqpError::InvalidConfiguration(format!(
                "speed must be a non-negative number, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

/// Loads a configuration value from a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, AmqpError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        AmqpError::InvalidConfiguration(format!("{}: {err}", path.display()))
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|err| {
        AmqpError::InvalidConfiguration(format!("{}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_exchange_with_binding_key() {
        let cfg: ExchangeConfiguration = "amq.topic:my.key".parse().unwrap();
        assert_eq!(cfg, ExchangeConfiguration::new("amq.topic", "my.key"));
    }

    #[test]
    fn should_keep_empty_binding_key() {
        let cfg: ExchangeConfiguration = "amq.fanout:".parse().unwrap();
        assert_eq!(cfg.binding_key, "");
    }

    #[test]
    fn should_default_binding_key_to_wildcard() {
        let cfg: ExchangeConfiguration = "amq.topic".parse().unwrap();
        assert_eq!(cfg.binding_key, DEFAULT_BINDING_KEY);
    }

    #[test]
    fn should_reject_missing_exchange() {
        let err = ":key".parse::<ExchangeConfiguration>().unwrap_err();
        assert!(matches!(err, AmqpError::InvalidConfiguration(_)));
    }

    #[test]
    fn should_deserialize_tap_options_with_defaults() {
        let opts: TapOptions = serde_json::from_str(r#"{"idle_timeout_ms": 1500}"#).unwrap();

        assert_eq!(opts.idle_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(opts.connection_name, "amqp-tap");
        assert!(opts.redial.fail_early);
    }

    #[test]
    fn should_reject_negative_speed() {
        let cfg = ReplayConfig {
            speed: -1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ReplayConfig::default().validate().is_ok());
    }

    #[test]
    fn should_load_tap_configurations_from_json_file() {
        let path = std::env::temp_dir().join(format!("amqp-tap-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r##"[{"amqp_url": "amqp://localhost:5672", "exchanges": [{"exchange": "amq.topic", "binding_key": "#"}]}]"##,
        )
        .unwrap();

        let configs: Vec<TapConfiguration> = load_json(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].exchanges, vec![ExchangeConfiguration::new("amq.topic", "#")]);
    }

    #[test]
    fn should_report_missing_configuration_file() {
        let result: Result<TapOptions, _> = load_json("/nonexistent/amqp-tap.json");

        assert!(matches!(result, Err(AmqpError::InvalidConfiguration(_))));
    }
}
