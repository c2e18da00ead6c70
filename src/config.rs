//! Configuration management for fluxguard.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{FluxGuardError, Result};
use crate::ratelimit::{KeyMode, Limiter, RuleSet, DEFAULT_MAX_ATTEMPTS};
use crate::store::{KeyedStateStore, MemoryStore, RedisStore, RedisStoreConfig};

/// Prefix of environment variables read by [`FluxGuardConfig::load`].
pub const ENV_PREFIX: &str = "FLUXGUARD";

/// Main configuration for a fluxguard instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxGuardConfig {
    /// Identifier of this instance, included in startup logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter rule per key mode
    #[serde(default)]
    pub rules: RuleSet,
}

impl Default for FluxGuardConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            rules: RuleSet::default(),
        }
    }
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Which store holds limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Redis shared by every instance
    Redis,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix applied to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Optimistic update attempts before a check fails open
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Soft cap on the number of records kept by the memory store
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            max_attempts: default_max_attempts(),
            max_keys: None,
        }
    }
}

fn default_key_prefix() -> String {
    "fluxguard:".to_string()
}

fn default_command_timeout_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FluxGuardConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FluxGuardError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file and the environment.
    ///
    /// Later sources win: the file, then `FLUXGUARD__`-prefixed variables
    /// (`FLUXGUARD__STORE__BACKEND=redis`), then `REDIS_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(FluxGuardError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let config: FluxGuardConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("store.redis_url", std::env::var("REDIS_URL").ok())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.store.max_attempts == 0 {
            return Err(FluxGuardError::Config(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(FluxGuardError::Config(
                "store.command_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(FluxGuardError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the configured state store.
    pub fn build_store(&self) -> Result<Arc<dyn KeyedStateStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                let store = match self.store.max_keys {
                    Some(max_keys) => MemoryStore::with_max_keys(max_keys),
                    None => MemoryStore::new(),
                };
                info!(max_keys = ?self.store.max_keys, "Using in-memory state store");
                Ok(Arc::new(store))
            }
            StoreBackend::Redis => {
                let url = self.store.redis_url.clone().ok_or_else(|| {
                    FluxGuardError::Config(
                        "store.redis_url is required for the redis backend".to_string(),
                    )
                })?;
                let mut redis_config = RedisStoreConfig::new(url);
                redis_config.key_prefix = self.store.key_prefix.clone();
                redis_config.command_timeout =
                    Duration::from_millis(self.store.command_timeout_ms);

                let store = RedisStore::new(redis_config)?;
                info!(key_prefix = %self.store.key_prefix, "Using Redis state store");
                Ok(Arc::new(store))
            }
        }
    }

    /// Build the limiter configured for `mode` over `store`.
    ///
    /// Modes without a rule use the default sliding window.
    pub fn limiter_for(
        &self,
        mode: KeyMode,
        store: Arc<dyn KeyedStateStore>,
    ) -> Result<Arc<dyn Limiter>> {
        self.rules
            .rule_or_default(mode)
            .build_limiter(store, self.store.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RuleConfig;

    #[test]
    fn test_defaults() {
        let config = FluxGuardConfig::from_yaml("{}").unwrap();
        assert!(!config.instance_id.is_empty());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "fluxguard:");
        assert_eq!(config.store.command_timeout_ms, 250);
        assert_eq!(config.store.max_attempts, 64);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
instance_id: edge-1
store:
  backend: redis
  redis_url: redis://127.0.0.1:6379
  key_prefix: "api:"
  command_timeout_ms: 100
logging:
  level: debug
  json: true
rules:
  ip:
    algorithm: sliding_window
    limit: 10
    window_ms: 1000
    bucket_count: 5
  apiKey:
    algorithm: token_bucket
    capacity: 5
    refill_per_second: 2.0
"#;
        let config = FluxGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.instance_id, "edge-1");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.store.key_prefix, "api:");
        assert_eq!(config.store.command_timeout_ms, 100);
        assert!(config.logging.json);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(
            config.rules.rule_for(KeyMode::ApiKey),
            Some(&RuleConfig::TokenBucket {
                capacity: 5,
                refill_per_second: 2.0,
                ttl_ms: 3_600_000,
            })
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let config = FluxGuardConfig::from_yaml("store:\n  backend: redis\n").unwrap();
        assert!(config.validate().is_err());
        assert!(config.build_store().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = FluxGuardConfig::from_yaml("store:\n  max_attempts: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join(format!("fluxguard-{}.yaml", uuid::Uuid::new_v4()));
        assert!(FluxGuardConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("fluxguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "instance_id: from-file\nstore:\n  max_keys: 500\nrules:\n  user:\n    algorithm: token_bucket\n    capacity: 3\n",
        )
        .unwrap();

        let config = FluxGuardConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.instance_id, "from-file");
        assert_eq!(config.store.max_keys, Some(500));
        assert_eq!(
            config.rules.rule_for(KeyMode::User),
            Some(&RuleConfig::TokenBucket {
                capacity: 3,
                refill_per_second: 1.0,
                ttl_ms: 3_600_000,
            })
        );
    }

    #[tokio::test]
    async fn test_limiter_for_mode() {
        let config = FluxGuardConfig::from_yaml(
            "rules:\n  user:\n    algorithm: token_bucket\n    capacity: 2\n",
        )
        .unwrap();
        let store = config.build_store().unwrap();

        let user = config.limiter_for(KeyMode::User, store.clone()).unwrap();
        assert_eq!(user.algorithm(), "token_bucket");
        assert_eq!(user.limit(), 2);

        let ip = config.limiter_for(KeyMode::Ip, store).unwrap();
        assert_eq!(ip.algorithm(), "sliding_window");
        assert_eq!(ip.limit(), 100);
    }
}
