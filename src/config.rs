use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// "postgres" or "memory"
    pub kind: String,
    pub url: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            url: "postgres://localhost/shrike".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// "memory"; real drivers register under their own kind
    pub kind: String,
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            url: String::new(),
        }
    }
}

/// Outbox processor tuning. One processor loop runs per table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Rows claimed per pass.
    pub batch: i64,
    /// Poll interval between passes, in milliseconds.
    pub interval_ms: u64,
    /// Publish attempts before a row flips to FAILED.
    pub max_attempts: i32,
    /// How long SENT rows are retained before the reaper deletes them.
    pub retention_secs: u64,
    pub gc_interval_ms: u64,
    /// Backoff applied to failed publishes.
    pub publish_backoff_base_ms: u64,
    pub publish_backoff_multiplier: f64,
    pub publish_backoff_cap_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch: 50,
            interval_ms: 1_000,
            max_attempts: 5,
            retention_secs: 3_600,
            gc_interval_ms: 30_000,
            publish_backoff_base_ms: 500,
            publish_backoff_multiplier: 2.0,
            publish_backoff_cap_ms: 30_000,
        }
    }
}

impl OutboxConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Exponential publish backoff, capped.
    #[must_use]
    pub fn publish_backoff(&self, attempt: i32) -> Duration {
        let base = self.publish_backoff_base_ms as f64;
        let raw = base * self.publish_backoff_multiplier.powi(attempt.max(0));
        Duration::from_millis((raw as u64).min(self.publish_backoff_cap_ms))
    }
}

/// Default retry policy applied when a task declares `retry` without details
/// the engine needs; see [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1_000,
            multiplier: 2.0,
            cap_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// How far in the future event-wait (listen) rows are parked.
    pub event_park_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            event_park_secs: 86_400,
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (SHRIKE__*)
    /// 2. Config file (shrike.yaml in current dir or ~/.config/shrike/shrike.yaml)
    /// 3. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(
                config::File::with_name("shrike")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/shrike/shrike",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("SHRIKE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = config_builder.build()?;
        config.try_deserialize()
    }
}
