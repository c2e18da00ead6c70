//! Bucketed sliding-window limiter.
//!
//! The window is split into `bucket_count` equal slots arranged as a ring.
//! A request arriving at `now` lands in slot `floor(now / width) % bucket_count`.
//! Slots whose time has passed since the last write are zeroed lazily on the
//! next request for the key, by walking the ring forward from the last
//! written slot (exclusive) to the current slot (inclusive). Admission then
//! compares the sum of all slots against the limit.
//!
//! Accuracy is bounded by the slot width: over any interval of one window
//! length, at most one slot's worth of requests beyond the limit can be
//! admitted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::Limiter;
use super::decision::Decision;
use crate::error::{FluxGuardError, Result};
use crate::store::{transact, Fields, KeyedStateStore, Mutation, StoreError, StoreResult};

/// Namespace for sliding-window records in the store.
const KEY_NAMESPACE: &str = "sw";
/// Default number of optimistic update attempts per check.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

const LAST_BUCKET_FIELD: &str = "lastBucketIndex";
const EXPIRES_AT_FIELD: &str = "expiresAt";

fn bucket_field(index: usize) -> String {
    format!("bucket_{}", index)
}

/// Validated sliding-window parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    limit: u64,
    window_ms: u64,
    bucket_count: u32,
}

impl SlidingWindowConfig {
    /// Create a configuration, rejecting parameters that cannot work.
    ///
    /// The window must be a whole number of milliseconds that divides evenly
    /// into `bucket_count` slots.
    pub fn new(limit: u64, window: Duration, bucket_count: u32) -> Result<Self> {
        let window_ms = window.as_millis() as u64;

        if limit == 0 {
            return Err(FluxGuardError::Config(
                "sliding window limit must be at least 1".to_string(),
            ));
        }
        if bucket_count == 0 {
            return Err(FluxGuardError::Config(
                "sliding window bucket_count must be at least 1".to_string(),
            ));
        }
        if window_ms == 0 {
            return Err(FluxGuardError::Config(
                "sliding window duration must be at least 1ms".to_string(),
            ));
        }
        if window_ms % bucket_count as u64 != 0 {
            return Err(FluxGuardError::Config(format!(
                "sliding window of {}ms does not divide into {} equal buckets",
                window_ms, bucket_count
            )));
        }

        Ok(Self {
            limit,
            window_ms,
            bucket_count,
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Width of one slot in milliseconds.
    pub fn bucket_width_ms(&self) -> u64 {
        self.window_ms / self.bucket_count as u64
    }
}

/// Per-key ring of slot counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Admitted requests per slot
    pub counts: Vec<u64>,
    /// Slot of the last admitted request
    pub last_bucket_index: usize,
    /// Instant (Unix ms) after which the whole record is stale
    pub expires_at_ms: u64,
}

impl WindowState {
    fn fresh(bucket_count: usize, current_index: usize) -> Self {
        Self {
            counts: vec![0; bucket_count],
            last_bucket_index: current_index,
            expires_at_ms: 0,
        }
    }

    /// Decode a stored record laid out for `bucket_count` slots.
    pub fn from_fields(fields: &Fields, bucket_count: usize) -> std::result::Result<Self, String> {
        let parse = |name: &str| -> std::result::Result<u64, String> {
            fields
                .get(name)
                .ok_or_else(|| format!("missing field {}", name))?
                .parse::<u64>()
                .map_err(|e| format!("field {}: {}", name, e))
        };

        let counts = (0..bucket_count)
            .map(|i| parse(&bucket_field(i)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if fields.contains_key(&bucket_field(bucket_count)) {
            return Err(format!("record has more than {} buckets", bucket_count));
        }

        let last_bucket_index = parse(LAST_BUCKET_FIELD)? as usize;
        if last_bucket_index >= bucket_count {
            return Err(format!(
                "lastBucketIndex {} out of range for {} buckets",
                last_bucket_index, bucket_count
            ));
        }

        Ok(Self {
            counts,
            last_bucket_index,
            expires_at_ms: parse(EXPIRES_AT_FIELD)?,
        })
    }

    /// Encode the record as store fields.
    pub fn to_fields(&self) -> Fields {
        let mut fields: Fields = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, count)| (bucket_field(i), count.to_string()))
            .collect();
        fields.insert(
            LAST_BUCKET_FIELD.to_string(),
            self.last_bucket_index.to_string(),
        );
        fields.insert(EXPIRES_AT_FIELD.to_string(), self.expires_at_ms.to_string());
        fields
    }

    /// Zero the slots that rotated out since the last write.
    ///
    /// Clears every slot after `last_bucket_index` up to and including
    /// `current_index`, walking forward around the ring. Landing in the same
    /// slot as the last write clears nothing.
    pub fn evict_stale(&mut self, current_index: usize) {
        let bucket_count = self.counts.len();
        let diff = (current_index + bucket_count - self.last_bucket_index) % bucket_count;
        for step in 1..=diff {
            let index = (self.last_bucket_index + step) % bucket_count;
            self.counts[index] = 0;
        }
    }

    /// Absolute slot number of the last admitted request.
    ///
    /// Derived from the expiry, which is always `B` slots past it. A fresh
    /// state reports slot 0.
    pub fn last_absolute_bucket(&self, width_ms: u64) -> u64 {
        (self.expires_at_ms / width_ms).saturating_sub(self.counts.len() as u64)
    }

    /// Requests counted across the whole ring.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Sliding-window limiter over a keyed state store.
pub struct SlidingWindowLimiter {
    store: Arc<dyn KeyedStateStore>,
    config: SlidingWindowConfig,
    max_attempts: u32,
}

impl SlidingWindowLimiter {
    /// Create a limiter storing its state in `store`.
    pub fn new(store: Arc<dyn KeyedStateStore>, config: SlidingWindowConfig) -> Self {
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

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Check `key` at `now_ms`, surfacing store failures.
    pub async fn try_check(&self, key: &str, now_ms: u64) -> StoreResult<Decision> {
        let store_key = format!("{}:{}", KEY_NAMESPACE, key);

        trace!(key = %store_key, now_ms = now_ms, "Checking sliding window");

        transact(
            self.store.as_ref(),
            &store_key,
            now_ms,
            self.max_attempts,
            |fields| self.step(&store_key, fields, now_ms),
        )
        .await
    }

    /// Compute the decision and the record update for one attempt.
    fn step(&self, store_key: &str, fields: Option<&Fields>, now_ms: u64) -> Mutation<Decision> {
        let limit = self.config.limit;
        let window_ms = self.config.window_ms;
        let bucket_count = self.config.bucket_count as usize;
        let width = self.config.bucket_width_ms();

        let absolute_bucket = now_ms / width;
        let current_index = (absolute_bucket % bucket_count as u64) as usize;

        let loaded = fields.and_then(|fields| match WindowState::from_fields(fields, bucket_count) {
            Ok(state) if now_ms < state.expires_at_ms => Some(state),
            Ok(_) => {
                debug!(key = %store_key, "Window record expired, starting fresh");
                None
            }
            Err(reason) => {
                let error = StoreError::Malformed {
                    key: store_key.to_string(),
                    reason,
                };
                warn!(error = %error, "Malformed window record, starting fresh");
                None
            }
        });
        let mut state = loaded.unwrap_or_else(|| WindowState::fresh(bucket_count, current_index));

        // An instance whose clock trails the last writer must not rotate the
        // ring backwards; it counts against the newest slot instead.
        let last_absolute = state.last_absolute_bucket(width);
        let (slot, slot_absolute) = if absolute_bucket < last_absolute {
            trace!(
                key = %store_key,
                behind_ms = last_absolute * width - now_ms,
                "Clock behind last write, counting in newest slot"
            );
            (state.last_bucket_index, last_absolute)
        } else {
            state.evict_stale(current_index);
            (current_index, absolute_bucket)
        };
        let total = state.total();
        let reset_at_ms = (now_ms / window_ms + 1) * window_ms;

        if total >= limit {
            let retry_after = Duration::from_millis(width - now_ms % width);
            debug!(
                key = %store_key,
                total = total,
                limit = limit,
                "Sliding window limit reached"
            );
            return Mutation::Skip(Decision::reject(limit, reset_at_ms, retry_after));
        }

        state.counts[slot] += 1;
        state.last_bucket_index = slot;
        // Once the ring comes back around to this slot its count is stale.
        state.expires_at_ms = (slot_absolute + bucket_count as u64) * width;

        Mutation::Write {
            fields: state.to_fields(),
            ttl: Duration::from_millis(state.expires_at_ms - now_ms),
            outcome: Decision::allow(limit, limit - total - 1, reset_at_ms),
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
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
                Decision::fail_open(self.config.limit, now_ms)
            }
        }
    }

    fn limit(&self) -> u64 {
        self.config.limit
    }

    fn algorithm(&self) -> &'static str {
        "sliding_window"
    }
}
