//! Redis-backed state store shared between service instances.
//!
//! Each record is a Redis hash. Alongside the limiter's own fields the hash
//! carries a `revision` field that the compare-and-set script checks and bumps
//! inside a single server-side script, so the check and the write cannot be
//! interleaved with another instance's write.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Fields, KeyedStateStore, Snapshot, StoreError, StoreResult};

/// Name of the hash field holding the record revision.
const REVISION_FIELD: &str = "revision";

/// Compare-and-set over a hash record.
///
/// KEYS[1] record key. ARGV[1] expected revision ("" when no record was
/// observed), ARGV[2] TTL in milliseconds, ARGV[3] revision to store,
/// ARGV[4..] field/value pairs. Revisions are random tokens chosen by the
/// writer, so a key recreated after expiry never matches an old revision.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'revision')
if current == false then
    current = ''
end
if current ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
if #ARGV > 3 then
    redis.call('HSET', KEYS[1], 'revision', ARGV[3], unpack(ARGV, 4))
else
    redis.call('HSET', KEYS[1], 'revision', ARGV[3])
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;
/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix prepended to every key
    pub key_prefix: String,
    /// Upper bound on each store round trip, connection included
    pub command_timeout: Duration,
}

impl RedisStoreConfig {
    /// Create a configuration for `url` with default prefix and timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "fluxguard:".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// State store backed by Redis.
///
/// The connection is established lazily on first use. A failed connection
/// attempt is reported to that caller and retried on the next call, so the
/// store can be created while Redis is still down.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    cas_script: Script,
    key_prefix: String,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given configuration.
    ///
    /// Only the URL is validated here; no connection is made.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(
            key_prefix = %config.key_prefix,
            command_timeout_ms = config.command_timeout.as_millis() as u64,
            "Redis state store configured"
        );

        Ok(Self {
            client,
            connection: OnceCell::new(),
            cas_script: Script::new(COMPARE_AND_SET_SCRIPT),
            key_prefix: config.key_prefix,
            command_timeout: config.command_timeout,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .with_timeout(async {
                self.connection
                    .get_or_try_init(|| async {
                        debug!("Connecting to Redis");
                        ConnectionManager::new(self.client.clone()).await
                    })
                    .await
                    .cloned()
            })
            .await?;
        Ok(manager)
    }

    async fn with_timeout<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

/// Split a fetched hash into its revision and limiter fields.
fn into_snapshot(mut hash: HashMap<String, String>) -> Option<Snapshot> {
    if hash.is_empty() {
        return None;
    }
    let revision = hash.remove(REVISION_FIELD).unwrap_or_default();
    Some(Snapshot {
        revision,
        fields: hash,
    })
}

#[async_trait]
impl KeyedStateStore for RedisStore {
    async fn load(&self, key: &str, _now_ms: u64) -> StoreResult<Option<Snapshot>> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);

        let hash: HashMap<String, String> = self.with_timeout(conn.hgetall(&full_key)).await?;
        Ok(into_snapshot(hash))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        fields: Fields,
        ttl: Duration,
        _now_ms: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let revision = uuid::Uuid::new_v4().simple().to_string();

        let mut invocation = self.cas_script.key(&full_key);
        invocation
            .arg(expected.unwrap_or(""))
            .arg(ttl_ms)
            .arg(&revision);
        for (field, value) in fields.iter().filter(|(f, _)| f.as_str() != REVISION_FIELD) {
            invocation.arg(field).arg(value);
        }

        let applied: i64 = self.with_timeout(invocation.invoke_async(&mut conn)).await?;
        Ok(applied == 1)
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let full_key = self.full_key(key);

        let removed: i64 = self.with_timeout(conn.del(&full_key)).await?;
        if removed == 0 {
            warn!(key = %full_key, "Remove requested for missing key");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
