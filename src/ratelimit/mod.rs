//! Rate limiting logic and state management.

pub mod cas;
mod clock;
mod engine;
mod keys;
mod registry;
mod rules;

pub use cas::{CasOutcome, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{RefillOutcome, RefillReport, TokenBucketEngine, MAX_ACQUIRE_ATTEMPTS};
pub use keys::{BucketKeys, LAST_REFILLED_PREFIX, TOKEN_BUCKET_PREFIX};
pub use registry::Registry;
pub use rules::{
    KeyLimit, LimitKeyConfig, RateLimitRule, RuleConfig, RuleDefinition, RuleId, RulesConfig,
    TimeWindow,
};
