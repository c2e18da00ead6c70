//! Limiter trait for abstracting over the limiting algorithms.

use async_trait::async_trait;

use super::decision::Decision;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the sliding-window and token-bucket limiters so
/// the middleware adapter can work with either.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide whether one request for `key` at `now_ms` is admitted.
    ///
    /// Never fails: if the limiter's state cannot be consulted the request is
    /// admitted.
    async fn check(&self, key: &str, now_ms: u64) -> Decision;

    /// The configured limit reported in decisions.
    fn limit(&self) -> u64;

    /// Algorithm name for logs.
    fn algorithm(&self) -> &'static str;
}
