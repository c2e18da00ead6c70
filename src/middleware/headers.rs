//! Standard rate limit response headers.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};

use crate::ratelimit::Decision;

/// Limit in force for the caller.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left before the caller is rejected.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Unix time in seconds at which the quota replenishes.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Headers describing `decision`.
///
/// `Retry-After` is only present on rejections.
pub fn rate_limit_headers(decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
    if let Some(retry_after) = decision.retry_after_secs() {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    headers
}
