//! HTTP integration: turns limiter decisions into verdicts and headers.

mod adapter;
mod headers;

pub use adapter::{
    LimiterAdapter, Rejection, RejectionBody, RejectionMessage, Verdict, DEFAULT_MESSAGE,
};
pub use headers::{rate_limit_headers, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
