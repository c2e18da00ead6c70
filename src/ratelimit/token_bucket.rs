//! Token bucket limiter.
//!
//! Each key owns a bucket holding up to `capacity` tokens that refills
//! continuously at `refill_per_second`. An admitted request spends one token.
//! Token counts are real-valued; only the reported `remaining` is floored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::Limiter;
use super::decision::Decision;
use super::sliding_window::DEFAULT_MAX_ATTEMPTS;
use crate::error::{FluxGuardError, Result};
use crate::store::{transact, Fields, KeyedStateStore, Mutation, StoreError, StoreResult};

/// Namespace for token-bucket records in the store.
const KEY_NAMESPACE: &str = "tb";

const TOKENS_FIELD: &str = "tokens";
const LAST_REFILL_FIELD: &str = "lastRefill";
const EXPIRES_AT_FIELD: &str = "expiresAt";

/// Validated token-bucket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    capacity: u64,
    refill_per_second: f64,
    ttl: Duration,
}

impl TokenBucketConfig {
    /// Create a configuration, rejecting parameters that cannot work.
    ///
    /// `ttl` only bounds how long an idle bucket is kept; a bucket idle for
    /// longer starts over full.
    pub fn new(capacity: u64, refill_per_second: f64, ttl: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(FluxGuardError::Config(
                "token bucket capacity must be at least 1".to_string(),
            ));
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(FluxGuardError::Config(format!(
                "token bucket refill rate must be a positive number, got {}",
                refill_per_second
            )));
        }
        if ttl.as_millis() == 0 {
            return Err(FluxGuardError::Config(
                "token bucket ttl must be at least 1ms".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            refill_per_second,
            ttl,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whole seconds until `tokens` reaches one token.
    fn seconds_until_token(&self, tokens: f64) -> u64 {
        ((1.0 - tokens) / self.refill_per_second).ceil().max(1.0) as u64
    }
}

/// Per-key bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    /// Tokens available, in `[0, capacity]`
    pub tokens: f64,
    /// Instant (Unix ms) of the last refill computation
    pub last_refill_ms: u64,
    /// Instant (Unix ms) after which an idle bucket is discarded
    pub expires_at_ms: u64,
}

impl TokenBucketState {
    /// Decode a stored record.
    pub fn from_fields(fields: &Fields) -> std::result::Result<Self, String> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| format!("missing field {}", name))
        };

        let tokens: f64 = get(TOKENS_FIELD)?
            .parse()
            .map_err(|e| format!("field {}: {}", TOKENS_FIELD, e))?;
        if !tokens.is_finite() || tokens < 0.0 {
            return Err(format!("token count {} out of range", tokens));
        }

        Ok(Self {
            tokens,
            last_refill_ms: get(LAST_REFILL_FIELD)?
                .parse()
                .map_err(|e| format!("field {}: {}", LAST_REFILL_FIELD, e))?,
            expires_at_ms: get(EXPIRES_AT_FIELD)?
                .parse()
                .map_err(|e| format!("field {}: {}", EXPIRES_AT_FIELD, e))?,
        })
    }

    /// Encode the record as store fields.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(TOKENS_FIELD.to_string(), self.tokens.to_string());
        fields.insert(LAST_REFILL_FIELD.to_string(), self.last_refill_ms.to_string());
        fields.insert(EXPIRES_AT_FIELD.to_string(), self.expires_at_ms.to_string());
        fields
    }
}

/// Token-bucket limiter over a keyed state store.
pub struct TokenBucketLimiter {
    store: Arc<dyn KeyedStateStore>,
    config: TokenBucketConfig,
    max_attempts: u32,
}

impl TokenBucketLimiter {
    /// Create a limiter storing its state in `store`.
    pub fn new(store: Arc<dyn KeyedStateStore>, config: TokenBucketConfig) -> Self {
        Self {
            store,
            config,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Bound the optimistic update attempts per check.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Check `key` at `now_ms`, surfacing store failures.
    pub async fn try_check(&self, key: &str, now_ms: u64) -> StoreResult<Decision> {
        let store_key = format!("{}:{}", KEY_NAMESPACE, key);

        trace!(key = %store_key, now_ms = now_ms, "Checking token bucket");

        transact(
            self.store.as_ref(),
            &store_key,
            now_ms,
            self.max_attempts,
            |fields| self.step(&store_key, fields, now_ms),
        )
        .await
    }

    fn step(&self, store_key: &str, fields: Option<&Fields>, now_ms: u64) -> Mutation<Decision> {
        let capacity = self.config.capacity as f64;
        let limit = self.config.capacity;

        let loaded = fields.and_then(|fields| match TokenBucketState::from_fields(fields) {
            Ok(state) if now_ms < state.expires_at_ms => Some(state),
            Ok(_) => {
                debug!(key = %store_key, "Idle bucket expired, refilling");
                None
            }
            Err(reason) => {
                let error = StoreError::Malformed {
                    key: store_key.to_string(),
                    reason,
                };
                warn!(error = %error, "Malformed bucket record, refilling");
                None
            }
        });
        let fresh = loaded.is_none();
        let mut state = loaded.unwrap_or(TokenBucketState {
            tokens: capacity,
            last_refill_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(self.config.ttl.as_millis() as u64),
        });

        // A clock that steps backwards refills nothing rather than draining.
        let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
        let refill = elapsed_ms as f64 / 1000.0 * self.config.refill_per_second;
        state.tokens = (state.tokens + refill).min(capacity);
        state.last_refill_ms = state.last_refill_ms.max(now_ms);

        if state.tokens < 1.0 {
            let retry_secs = self.config.seconds_until_token(state.tokens);
            let decision = Decision::reject(
                limit,
                now_ms.saturating_add(retry_secs.saturating_mul(1000)),
                Duration::from_secs(retry_secs),
            );
            debug!(
                key = %store_key,
                tokens = state.tokens,
                retry_after_secs = retry_secs,
                "Token bucket empty"
            );

            if elapsed_ms == 0 && !fresh {
                return Mutation::Skip(decision);
            }
            // Keep the refill progress; the idle deadline is left as it was.
            let ttl_ms = state.expires_at_ms.saturating_sub(now_ms).max(1);
            return Mutation::Write {
                fields: state.to_fields(),
                ttl: Duration::from_millis(ttl_ms),
                outcome: decision,
            };
        }

        state.tokens -= 1.0;
        state.expires_at_ms = now_ms.saturating_add(self.config.ttl.as_millis() as u64);

        let reset_at_ms = if state.tokens >= 1.0 {
            now_ms
        } else {
            let wait_secs = self.config.seconds_until_token(state.tokens);
            now_ms.saturating_add(wait_secs.saturating_mul(1000))
        };

        Mutation::Write {
            fields: state.to_fields(),
            ttl: self.config.ttl,
            outcome: Decision::allow(limit, state.tokens.floor() as u64, reset_at_ms),
        }
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn check(&self, key: &str, now_ms: u64) -> Decision {
        match self.try_check(key, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    key = %key,
                    backend = self.store.backend_name(),
                    error = %e,
                    "State store unavailable, failing open"
                );
                Decision::fail_open(self.config.capacity, now_ms)
            }
        }
    }

    fn limit(&self) -> u64 {
        self.config.capacity
    }

    fn algorithm(&self) -> &'static str {
        "token_bucket"
    }
}
