//! Store doubles for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Fields, KeyedStateStore, Snapshot, StoreError, StoreResult};

/// Wraps a store and fails every call while switched to failing.
pub struct FailingStore<S> {
    inner: S,
    failing: AtomicBool,
}

impl<S: KeyedStateStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: KeyedStateStore> KeyedStateStore for FailingStore<S> {
    async fn load(&self, key: &str, now_ms: u64) -> StoreResult<Option<Snapshot>> {
        self.check()?;
        self.inner.load(key, now_ms).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        fields: Fields,
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner
            .compare_and_set(key, expected, fields, ttl, now_ms)
            .await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.remove(key).await
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
