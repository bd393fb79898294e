//! A single rate limiting worker.
//!
//! Workers never talk to each other. Each one loads the same rules, keeps its
//! own registry, and meets the others only through the shared store.

use std::sync::Arc;

use http::Request;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::{too_many_requests, Action, RuleFilter};
use crate::ratelimit::{
    Clock, RateLimitRule, RefillReport, Registry, RuleId, RulesConfig, TokenBucketEngine,
};
use crate::store::SharedStore;

#[derive(Debug, Default)]
struct WorkerState {
    registry: Registry,
    filters: Vec<RuleFilter>,
}

/// One worker instance.
#[derive(Debug)]
pub struct Worker {
    id: Uuid,
    engine: TokenBucketEngine,
    state: RwLock<WorkerState>,
}

impl Worker {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: Uuid::new_v4(),
            engine: TokenBucketEngine::new(store, clock),
            state: RwLock::new(WorkerState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> &TokenBucketEngine {
        &self.engine
    }

    /// Make `rules` the active rule set.
    ///
    /// Every rule is validated before anything is registered. Each rule then
    /// gets a fresh id and its buckets are initialized; if any bucket fails,
    /// the rules registered by this call are retired again and the previous
    /// set stays active. On success the previous set is retired.
    ///
    /// Store traffic happens outside the state lock, so requests keep being
    /// served against the previous rules while the new buckets initialize.
    pub fn apply(&self, rules: &RulesConfig) -> Result<Vec<RuleId>> {
        let definitions = rules.validate()?;

        let (filters, buckets) = {
            let mut state = self.state.write();
            let mut filters = Vec::with_capacity(definitions.len());
            let mut buckets = Vec::new();
            for definition in &definitions {
                let rule_id = state.registry.register(definition);
                filters.push(RuleFilter::new(rule_id, definition));
                buckets.extend_from_slice(state.registry.rules_for(rule_id));
            }
            (filters, buckets)
        };
        let rule_ids: Vec<RuleId> = filters.iter().map(RuleFilter::rule_id).collect();

        if let Err(err) = buckets.iter().try_for_each(|rule| self.engine.initialize(rule)) {
            let mut state = self.state.write();
            for rule_id in &rule_ids {
                state.registry.retire(*rule_id);
            }
            return Err(err);
        }

        let mut state = self.state.write();
        let previous = std::mem::replace(&mut state.filters, filters);
        for filter in &previous {
            state.registry.retire(filter.rule_id());
        }
        drop(state);

        info!(worker = %self.id, rules = ?rule_ids, "Rate limit rules applied");
        Ok(rule_ids)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Every active rule that recognises the request's key must grant a token.
    pub fn handle<B>(&self, request: &Request<B>) -> Action {
        let state = self.state.read();

        for filter in &state.filters {
            let Some(key) = filter.classify(request) else {
                continue;
            };
            if !self.engine.acquire(filter.rule_id(), &key) {
                debug!(worker = %self.id, rule_id = %filter.rule_id(), key = %key, "Request rate limited");
                return Action::Reject(too_many_requests());
            }
        }

        Action::Continue
    }

    /// Run one refill pass over the active rules.
    pub fn refill(&self) -> RefillReport {
        let state = self.state.read();
        self.engine.refill(&state.registry)
    }

    /// Ids of the active rules.
    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.state.read().filters.iter().map(RuleFilter::rule_id).collect()
    }

    /// Snapshot of every active bucket.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.state.read().registry.iter().cloned().collect()
    }
}
