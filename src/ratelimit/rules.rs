//! Rate limit rules configuration.
//!
//! A rule names the algorithm to use for one key mode and carries its
//! parameters. Rules are plain configuration; they are validated when turned
//! into a limiter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::backend::Limiter;
use super::key::KeyMode;
use super::sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
use super::token_bucket::{TokenBucketConfig, TokenBucketLimiter};
use crate::error::{FluxGuardError, Result};
use crate::store::KeyedStateStore;

/// Limiter algorithm and parameters for one key mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RuleConfig {
    /// Bucketed sliding-window counter
    SlidingWindow {
        /// Requests allowed per window
        #[serde(default = "default_limit")]
        limit: u64,
        /// Window length in milliseconds
        #[serde(default = "default_window_ms")]
        window_ms: u64,
        /// Number of slots the window is divided into
        #[serde(default = "default_bucket_count")]
        bucket_count: u32,
    },
    /// Continuously refilling token bucket
    TokenBucket {
        /// Bucket size (burst)
        #[serde(default = "default_capacity")]
        capacity: u64,
        /// Tokens added per second
        #[serde(default = "default_refill_per_second")]
        refill_per_second: f64,
        /// Idle time after which a bucket is discarded, in milliseconds
        #[serde(default = "default_ttl_ms")]
        ttl_ms: u64,
    },
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_bucket_count() -> u32 {
    12
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_per_second() -> f64 {
    1.0
}

fn default_ttl_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig::SlidingWindow {
            limit: default_limit(),
            window_ms: default_window_ms(),
            bucket_count: default_bucket_count(),
        }
    }
}

impl RuleConfig {
    /// Validate the rule and build its limiter over `store`.
    pub fn build_limiter(
        &self,
        store: Arc<dyn KeyedStateStore>,
        max_attempts: u32,
    ) -> Result<Arc<dyn Limiter>> {
        match *self {
            RuleConfig::SlidingWindow {
                limit,
                window_ms,
                bucket_count,
            } => {
                let config =
                    SlidingWindowConfig::new(limit, Duration::from_millis(window_ms), bucket_count)?;
                Ok(Arc::new(
                    SlidingWindowLimiter::new(store, config).with_max_attempts(max_attempts),
                ))
            }
            RuleConfig::TokenBucket {
                capacity,
                refill_per_second,
                ttl_ms,
            } => {
                let config = TokenBucketConfig::new(
                    capacity,
                    refill_per_second,
                    Duration::from_millis(ttl_ms),
                )?;
                Ok(Arc::new(
                    TokenBucketLimiter::new(store, config).with_max_attempts(max_attempts),
                ))
            }
        }
    }
}

/// Rules keyed by mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: HashMap<KeyMode, RuleConfig>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML mapping of mode to rule.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FluxGuardError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Add or replace the rule for `mode`.
    pub fn insert(&mut self, mode: KeyMode, rule: RuleConfig) {
        self.rules.insert(mode, rule);
    }

    /// Get the rule for `mode`, if one is configured.
    pub fn rule_for(&self, mode: KeyMode) -> Option<&RuleConfig> {
        self.rules.get(&mode)
    }

    /// Get the rule for `mode`, falling back to the default rule.
    pub fn rule_or_default(&self, mode: KeyMode) -> RuleConfig {
        self.rule_for(mode).cloned().unwrap_or_default()
    }

    /// Validate every configured rule without building long-lived limiters.
    pub fn validate(&self, store: Arc<dyn KeyedStateStore>) -> Result<()> {
        for (mode, rule) in &self.rules {
            rule.build_limiter(store.clone(), 1).map_err(|e| {
                FluxGuardError::Config(format!("invalid rule for mode {}: {}", mode, e))
            })?;
            info!(mode = %mode, rule = ?rule, "Rate limit rule validated");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn KeyedStateStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_parse_rules_per_mode() {
        let yaml = r#"
ip:
  algorithm: sliding_window
  limit: 50
  window_ms: 10000
  bucket_count: 10
apiKey:
  algorithm: token_bucket
  capacity: 20
  refill_per_second: 0.5
user:
  algorithm: token_bucket
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 3);

        assert_eq!(
            rules.rule_for(KeyMode::Ip),
            Some(&RuleConfig::SlidingWindow {
                limit: 50,
                window_ms: 10_000,
                bucket_count: 10,
            })
        );
        assert_eq!(
            rules.rule_for(KeyMode::ApiKey),
            Some(&RuleConfig::TokenBucket {
                capacity: 20,
                refill_per_second: 0.5,
                ttl_ms: 3_600_000,
            })
        );
        assert_eq!(
            rules.rule_for(KeyMode::User),
            Some(&RuleConfig::TokenBucket {
                capacity: 100,
                refill_per_second: 1.0,
                ttl_ms: 3_600_000,
            })
        );
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let yaml = r#"
ip:
  algorithm: leaky_bucket
"#;
        assert!(RuleSet::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_mode_falls_back_to_default() {
        let rules = RuleSet::new();
        assert!(rules.rule_for(KeyMode::User).is_none());
        assert_eq!(rules.rule_or_default(KeyMode::User), RuleConfig::default());
    }

    #[tokio::test]
    async fn test_build_limiters() {
        let sliding = RuleConfig::default().build_limiter(store(), 8).unwrap();
        assert_eq!(sliding.algorithm(), "sliding_window");
        assert_eq!(sliding.limit(), 100);

        let bucket = RuleConfig::TokenBucket {
            capacity: 3,
            refill_per_second: 1.0,
            ttl_ms: 1_000,
        }
        .build_limiter(store(), 8)
        .unwrap();
        assert_eq!(bucket.algorithm(), "token_bucket");
        assert_eq!(bucket.check("k", 0).await.remaining, 2);
    }

    #[test]
    fn test_validate_reports_bad_rule() {
        let mut rules = RuleSet::new();
        rules.insert(
            KeyMode::Ip,
            RuleConfig::SlidingWindow {
                limit: 10,
                window_ms: 1_000,
                bucket_count: 7,
            },
        );

        let err = rules.validate(store()).unwrap_err();
        assert!(err.to_string().contains("mode ip"));
    }
}
