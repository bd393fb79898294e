//! Registered rules of one worker.

use std::collections::BTreeMap;

use tracing::debug;

use super::rules::{RateLimitRule, RuleDefinition, RuleId};

/// Owns every rule a worker has registered, keyed by rule id.
///
/// Ids are handed out in registration order starting at 0. Workers that load
/// the same rules in the same order therefore agree on ids, and so on the
/// store keys of every bucket.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: u32,
    rules: BTreeMap<RuleId, Vec<RateLimitRule>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule and return its id.
    pub fn register(&mut self, definition: &RuleDefinition) -> RuleId {
        let rule_id = RuleId(self.next_id);
        self.next_id += 1;

        let limits = definition
            .limits
            .iter()
            .map(|limit| RateLimitRule::new(rule_id, limit))
            .collect();
        self.rules.insert(rule_id, limits);

        debug!(rule_id = %rule_id, keys = definition.limits.len(), "Registered rule");
        rule_id
    }

    /// The buckets registered under `rule_id`, empty if the id is unknown.
    pub fn rules_for(&self, rule_id: RuleId) -> &[RateLimitRule] {
        self.rules.get(&rule_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stop tracking a rule. Its id is never handed out again.
    pub fn retire(&mut self, rule_id: RuleId) -> Option<Vec<RateLimitRule>> {
        let removed = self.rules.remove(&rule_id);
        if removed.is_some() {
            debug!(rule_id = %rule_id, "Retired rule");
        }
        removed
    }

    /// Every registered bucket, in rule id order.
    pub fn iter(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.values().flatten()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
