//! Keyed state storage for limiter records.
//!
//! A store maps a key to a small record of string fields plus an opaque
//! revision. Limiters never write blindly: every update goes through
//! [`transact`], which reads a snapshot, computes the new record and writes it
//! back with a compare-and-set on the snapshot's revision. Two concurrent
//! updates of the same key can therefore never both apply on top of the same
//! state, whether they run in one process or in many.

mod memory;
mod shared;
#[cfg(test)]
pub(crate) mod testing;

pub use self::memory::MemoryStore;
pub use self::shared::{RedisStore, RedisStoreConfig};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// Field map stored per key.
pub type Fields = HashMap<String, String>;

/// Errors raised by state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A store command did not complete in time.
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// A record exists but cannot be decoded.
    #[error("malformed record for key {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Optimistic updates kept conflicting with concurrent writers.
    #[error("gave up updating {key} after {attempts} conflicting attempts")]
    Contention { key: String, attempts: u32 },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A record as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Revision to pass back to [`KeyedStateStore::compare_and_set`].
    pub revision: String,
    /// Stored fields.
    pub fields: Fields,
}

/// Storage for per-key limiter state.
#[async_trait]
pub trait KeyedStateStore: Send + Sync {
    /// Load the live record for `key`, or `None` if it is absent or expired.
    async fn load(&self, key: &str, now_ms: u64) -> StoreResult<Option<Snapshot>>;

    /// Replace the record for `key` if its revision still matches `expected`.
    ///
    /// `expected` is `None` when the caller observed no record. The whole
    /// record is replaced and its time-to-live reset to `ttl`. Returns `false`
    /// without writing when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        fields: Fields,
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<bool>;

    /// Delete the record for `key`.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// What a transaction step decided to do with the record.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Replace the record and return `outcome` once the write lands.
    Write {
        fields: Fields,
        ttl: Duration,
        outcome: T,
    },
    /// Leave the record untouched.
    Skip(T),
}

/// Run an optimistic read-modify-write against `store`.
///
/// `step` sees the current fields (or `None`) and decides the mutation. When
/// the compare-and-set loses a race the step runs again on fresh state, up to
/// `max_attempts` times.
pub async fn transact<S, T, F>(
    store: &S,
    key: &str,
    now_ms: u64,
    max_attempts: u32,
    mut step: F,
) -> StoreResult<T>
where
    S: KeyedStateStore + ?Sized,
    F: FnMut(Option<&Fields>) -> Mutation<T> + Send,
    T: Send,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let snapshot = store.load(key, now_ms).await?;
        let mutation = step(snapshot.as_ref().map(|s| &s.fields));

        match mutation {
            Mutation::Skip(outcome) => return Ok(outcome),
            Mutation::Write {
                fields,
                ttl,
                outcome,
            } => {
                let expected = snapshot.as_ref().map(|s| s.revision.as_str());
                if store
                    .compare_and_set(key, expected, fields, ttl, now_ms)
                    .await?
                {
                    return Ok(outcome);
                }
                trace!(key = %key, attempt = attempt, "Revision conflict, retrying");
            }
        }
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: max_attempts,
    })
}
