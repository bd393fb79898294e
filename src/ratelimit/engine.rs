//! Token bucket engine over the shared store.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{KeyrateError, Result};
use crate::store::{SharedStore, StoreError};

use super::cas::{self, CasOutcome, RetryPolicy};
use super::clock::Clock;
use super::keys::BucketKeys;
use super::registry::Registry;
use super::rules::{RateLimitRule, RuleId};

/// Attempts `acquire` makes before admitting the request anyway.
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 20;

/// What a refill pass did for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// The gate could not be read; try again next tick.
    GateUnreadable,
    /// Less than one interval since the last refill.
    NotDue,
    /// Another worker claimed this interval first.
    ClaimLost,
    /// The claim write failed for a reason other than a lost race.
    ClaimFailed,
    /// This worker claimed the interval and the bucket now holds `tokens_left`.
    Refilled { tokens_left: u64 },
    /// The interval was claimed but the bucket became unreadable mid-update.
    Abandoned,
}

/// Tally of one refill pass across all buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillReport {
    pub refilled: usize,
    pub not_due: usize,
    pub claims_lost: usize,
    pub failed: usize,
}

impl RefillReport {
    fn record(&mut self, outcome: RefillOutcome) {
        match outcome {
            RefillOutcome::Refilled { .. } => self.refilled += 1,
            RefillOutcome::NotDue => self.not_due += 1,
            RefillOutcome::ClaimLost => self.claims_lost += 1,
            RefillOutcome::GateUnreadable | RefillOutcome::ClaimFailed | RefillOutcome::Abandoned => {
                self.failed += 1
            }
        }
    }
}

/// Token bucket state machine shared by every worker through the store.
///
/// Each bucket is two store keys: the remaining tokens and the refill gate
/// (the time of the last refill). The engine holds no bucket state of its own
/// and re-reads both keys on every call.
#[derive(Debug, Clone)]
pub struct TokenBucketEngine {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketEngine {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Establish a full bucket and a zeroed refill gate for `rule`.
    ///
    /// A bucket that already exists is reset, which is what a configuration
    /// reload expects.
    pub fn initialize(&self, rule: &RateLimitRule) -> Result<()> {
        let keys = BucketKeys::new(rule.rule_id, &rule.rate_limit_key);
        let fail = |source: StoreError| KeyrateError::Initialization {
            rule_id: rule.rule_id,
            key: rule.rate_limit_key.clone(),
            source,
        };

        match self.store.get(&keys.gate) {
            Err(StoreError::NotFound(_)) => {
                // First creation; a concurrent creator simply overwrites with the same values
                self.store.set_u64(&keys.gate, 0, None).map_err(fail)?;
                self.store
                    .set_u64(&keys.tokens, rule.max_tokens, None)
                    .map_err(fail)?;
                debug!(bucket = %keys, max_tokens = rule.max_tokens, "Created token bucket");
            }
            Ok(_) => {
                self.reset(&keys.gate, 0).map_err(fail)?;
                self.reset(&keys.tokens, rule.max_tokens).map_err(fail)?;
                debug!(bucket = %keys, max_tokens = rule.max_tokens, "Reset token bucket");
            }
            Err(err) => return Err(fail(err)),
        }

        Ok(())
    }

    /// Overwrite `key` with `value`, honouring concurrent writers.
    fn reset(&self, key: &str, value: u64) -> std::result::Result<(), StoreError> {
        match cas::update(&*self.store, key, RetryPolicy::Unbounded, |_| Some(value)) {
            Ok(_) => Ok(()),
            // Gate written but bucket missing: an earlier creation was cut short
            Err(StoreError::NotFound(_)) => self.store.set_u64(key, value, None),
            Err(err) => Err(err),
        }
    }

    /// Take one token from the bucket of (`rule_id`, `key`).
    ///
    /// Returns `false` only after reading an empty bucket. If every attempt
    /// loses a race or fails, the request is admitted.
    // TODO: fail-open after MAX_ACQUIRE_ATTEMPTS needs a product decision; keep it until then
    pub fn acquire(&self, rule_id: RuleId, key: &str) -> bool {
        let keys = BucketKeys::new(rule_id, key);
        let policy = RetryPolicy::Bounded(MAX_ACQUIRE_ATTEMPTS);

        match cas::update(&*self.store, &keys.tokens, policy, |left| left.checked_sub(1)) {
            Ok(CasOutcome::Applied { current, .. }) => {
                trace!(bucket = %keys, tokens_left = current, "Token acquired");
                true
            }
            Ok(CasOutcome::Skipped { .. }) => {
                debug!(bucket = %keys, "Rate limit exceeded");
                false
            }
            Ok(CasOutcome::Exhausted { attempts }) => {
                warn!(bucket = %keys, attempts, "Bucket contended past retry budget, admitting request");
                true
            }
            Err(err) => {
                warn!(bucket = %keys, error = %err, "Token acquisition failed, admitting request");
                true
            }
        }
    }

    /// Run one refill pass over every bucket in `registry`.
    pub fn refill(&self, registry: &Registry) -> RefillReport {
        let mut report = RefillReport::default();
        for rule in registry.iter() {
            report.record(self.refill_rule(rule));
        }
        trace!(?report, "Refill pass complete");
        report
    }

    /// Refill one bucket if its interval has elapsed and this worker wins the claim.
    pub fn refill_rule(&self, rule: &RateLimitRule) -> RefillOutcome {
        let keys = BucketKeys::new(rule.rule_id, &rule.rate_limit_key);

        let (last_refilled, gate_version) = match self.store.get_u64(&keys.gate) {
            Ok(read) => read,
            Err(err) => {
                debug!(bucket = %keys, error = %err, "Refill gate unreadable, skipping");
                return RefillOutcome::GateUnreadable;
            }
        };

        let now = self.clock.now_nanos();
        if now < last_refilled || now - last_refilled < rule.refill_interval_nanos {
            return RefillOutcome::NotDue;
        }

        // Single attempt: losing means someone else owns this interval
        match self.store.set_u64(&keys.gate, now, Some(gate_version)) {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                trace!(bucket = %keys, "Refill claimed by another worker");
                return RefillOutcome::ClaimLost;
            }
            Err(err) => {
                debug!(bucket = %keys, error = %err, "Refill claim failed, skipping");
                return RefillOutcome::ClaimFailed;
            }
        }

        let (per_refill, max) = (rule.tokens_per_refill, rule.max_tokens);
        let outcome = cas::update(&*self.store, &keys.tokens, RetryPolicy::Unbounded, |left| {
            let next = left.saturating_add(per_refill).min(max);
            (next != left).then_some(next)
        });

        match outcome {
            Ok(CasOutcome::Applied { current, .. }) | Ok(CasOutcome::Skipped { current }) => {
                debug!(bucket = %keys, tokens_left = current, "Refilled token bucket");
                RefillOutcome::Refilled {
                    tokens_left: current,
                }
            }
            Ok(CasOutcome::Exhausted { .. }) => RefillOutcome::Abandoned,
            Err(err) => {
                warn!(bucket = %keys, error = %err, "Refill abandoned for this tick");
                RefillOutcome::Abandoned
            }
        }
    }

    /// Current token count of a bucket.
    pub fn tokens_left(&self, rule_id: RuleId, key: &str) -> std::result::Result<u64, StoreError> {
        let keys = BucketKeys::new(rule_id, key);
        self.store.get_u64(&keys.tokens).map(|(left, _)| left)
    }

    /// Time of a bucket's last refill, in nanoseconds since the epoch.
    pub fn last_refilled_at(&self, rule_id: RuleId, key: &str) -> std::result::Result<u64, StoreError> {
        let keys = BucketKeys::new(rule_id, key);
        self.store.get_u64(&keys.gate).map(|(at, _)| at)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
