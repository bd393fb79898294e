//! Store key derivation for token buckets.

use std::fmt;

use super::rules::RuleId;

/// Prefix of the key holding a bucket's remaining tokens.
pub const TOKEN_BUCKET_PREFIX: &str = "keyrate.token_bucket";
/// Prefix of the key holding a bucket's last refill timestamp.
pub const LAST_REFILLED_PREFIX: &str = "keyrate.last_refilled";

/// The pair of store keys backing one (rule, rate limit key) bucket.
///
/// Format: `"{prefix}|{rule_id}|{rate_limit_key}"`. The rule id is numeric and
/// comes before the free-form key, so two different pairs can never map to the
/// same store key even when the rate limit key contains the delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKeys {
    pub rule_id: RuleId,
    pub rate_limit_key: String,
    /// Store key of the remaining token count
    pub tokens: String,
    /// Store key of the refill gate
    pub gate: String,
}

impl BucketKeys {
    /// Derive both store keys for a bucket.
    pub fn new(rule_id: RuleId, rate_limit_key: &str) -> Self {
        Self {
            rule_id,
            rate_limit_key: rate_limit_key.to_string(),
            tokens: Self::format(TOKEN_BUCKET_PREFIX, rule_id, rate_limit_key),
            gate: Self::format(LAST_REFILLED_PREFIX, rule_id, rate_limit_key),
        }
    }

    fn format(prefix: &str, rule_id: RuleId, rate_limit_key: &str) -> String {
        format!("{}|{}|{}", prefix, rule_id, rate_limit_key)
    }
}

impl fmt::Display for BucketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.rate_limit_key)
    }
}
