//! Rate limiting algorithms and their supporting types.

mod backend;
mod clock;
mod decision;
mod key;
mod rules;
mod sliding_window;
mod token_bucket;

pub use backend::Limiter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use key::{IdentifierKey, KeyMode};
pub use rules::{RuleConfig, RuleSet};
pub use sliding_window::{
    SlidingWindowConfig, SlidingWindowLimiter, WindowState, DEFAULT_MAX_ATTEMPTS,
};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter, TokenBucketState};
