//! Rate limit rules configuration and validation.
//!
//! A rules file lists one or more rules. Each rule names the request header or
//! query parameter that carries the caller's key, and the set of keys it
//! limits together with their rate:
//!
//! ```yaml
//! rules:
//!   - limit_by_header: x-api-key
//!     limit_keys:
//!       - key: alice
//!         query_per_second: 10
//!       - key: bob
//!         query_per_minute: 100
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use http::header::HeaderName;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{KeyrateError, Result};
use crate::filter::KeySource;

/// Identifier assigned to a rule when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Refill window of a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Name of the configuration field selecting this window.
    pub fn field_name(&self) -> &'static str {
        match self {
            TimeWindow::Second => "query_per_second",
            TimeWindow::Minute => "query_per_minute",
            TimeWindow::Hour => "query_per_hour",
            TimeWindow::Day => "query_per_day",
        }
    }
}

/// A complete rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One rule as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Keys limited by this rule
    #[serde(default)]
    pub limit_keys: Vec<LimitKeyConfig>,
    /// Request header carrying the rate limit key
    #[serde(default)]
    pub limit_by_header: Option<String>,
    /// Query parameter carrying the rate limit key
    #[serde(default)]
    pub limit_by_param: Option<String>,
}

/// A single key and its rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitKeyConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub query_per_second: Option<u64>,
    #[serde(default)]
    pub query_per_minute: Option<u64>,
    #[serde(default)]
    pub query_per_hour: Option<u64>,
    #[serde(default)]
    pub query_per_day: Option<u64>,
}

/// A validated rule, ready to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub source: KeySource,
    pub limits: Vec<KeyLimit>,
}

/// The bucket parameters of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLimit {
    pub key: String,
    pub tokens_per_refill: u64,
    pub refill_interval: Duration,
    pub max_tokens: u64,
}

/// A registered bucket: one rate limit key under one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub rule_id: RuleId,
    pub rate_limit_key: String,
    pub tokens_per_refill: u64,
    pub refill_interval_nanos: u64,
    pub max_tokens: u64,
}

impl RateLimitRule {
    pub fn new(rule_id: RuleId, limit: &KeyLimit) -> Self {
        Self {
            rule_id,
            rate_limit_key: limit.key.clone(),
            tokens_per_refill: limit.tokens_per_refill,
            refill_interval_nanos: u64::try_from(limit.refill_interval.as_nanos())
                .unwrap_or(u64::MAX),
            max_tokens: limit.max_tokens,
        }
    }
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Validate every rule. Nothing is returned unless all of them pass.
    pub fn validate(&self) -> Result<Vec<RuleDefinition>> {
        if self.rules.is_empty() {
            return Err(KeyrateError::Validation("no rules found in configuration".into()));
        }

        self.rules
            .iter()
            .enumerate()
            .map(|(index, rule)| rule.validate(index))
            .collect()
    }
}

impl RuleConfig {
    /// Validate this rule; `index` is its position in the file.
    pub fn validate(&self, index: usize) -> Result<RuleDefinition> {
        if self.limit_keys.is_empty() {
            return Err(KeyrateError::validation(
                index,
                "no limit keys found in configuration",
            ));
        }

        let mut seen = HashSet::new();
        let mut limits = Vec::with_capacity(self.limit_keys.len());
        for item in &self.limit_keys {
            let limit = item.validate(index)?;
            if !seen.insert(limit.key.clone()) {
                return Err(KeyrateError::validation(
                    index,
                    format!("duplicate key {:?}", limit.key),
                ));
            }
            limits.push(limit);
        }

        let header = non_empty(&self.limit_by_header);
        let param = non_empty(&self.limit_by_param);
        let source = match (header, param) {
            (Some(header), None) => {
                let name = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                    KeyrateError::validation(index, format!("invalid header name {:?}: {}", header, e))
                })?;
                KeySource::Header(name)
            }
            (None, Some(param)) => KeySource::QueryParam(param.to_string()),
            _ => {
                return Err(KeyrateError::validation(
                    index,
                    "exactly one of 'limit_by_header' and 'limit_by_param' must be set",
                ))
            }
        };

        Ok(RuleDefinition { source, limits })
    }
}

impl LimitKeyConfig {
    fn rates(&self) -> impl Iterator<Item = (TimeWindow, u64)> {
        [
            (TimeWindow::Second, self.query_per_second),
            (TimeWindow::Minute, self.query_per_minute),
            (TimeWindow::Hour, self.query_per_hour),
            (TimeWindow::Day, self.query_per_day),
        ]
        .into_iter()
        .filter_map(|(window, rate)| rate.map(|n| (window, n)))
    }

    fn validate(&self, index: usize) -> Result<KeyLimit> {
        if self.key.is_empty() {
            return Err(KeyrateError::validation(index, "key name is required"));
        }

        let mut rates = self.rates();
        let (window, tokens) = rates.next().ok_or_else(|| {
            KeyrateError::validation(
                index,
                format!(
                    "key {:?}: one of 'query_per_second', 'query_per_minute', \
                     'query_per_hour' or 'query_per_day' must be set",
                    self.key
                ),
            )
        })?;
        if let Some((other, _)) = rates.next() {
            return Err(KeyrateError::validation(
                index,
                format!(
                    "key {:?}: only one rate may be set, found '{}' and '{}'",
                    self.key,
                    window.field_name(),
                    other.field_name()
                ),
            ));
        }

        Ok(KeyLimit {
            key: self.key.clone(),
            tokens_per_refill: tokens,
            refill_interval: window.duration(),
            max_tokens: tokens,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str) -> Result<Vec<RuleDefinition>> {
        RulesConfig::from_yaml(yaml)?.validate()
    }

    fn assert_invalid(yaml: &str, needle: &str) {
        match validate(yaml) {
            Err(KeyrateError::Validation(msg)) => {
                assert!(msg.contains(needle), "{:?} does not mention {:?}", msg, needle)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_header_rule() {
        let yaml = r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: alice
        query_per_second: 10
      - key: bob
        query_per_day: 1000
"#;
        let defs = validate(yaml).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(
            defs[0].source,
            KeySource::Header(HeaderName::from_static("x-api-key"))
        );
        assert_eq!(
            defs[0].limits,
            vec![
                KeyLimit {
                    key: "alice".into(),
                    tokens_per_refill: 10,
                    refill_interval: Duration::from_secs(1),
                    max_tokens: 10,
                },
                KeyLimit {
                    key: "bob".into(),
                    tokens_per_refill: 1000,
                    refill_interval: Duration::from_secs(86400),
                    max_tokens: 1000,
                },
            ]
        );
    }

    #[test]
    fn test_parse_param_rule() {
        let yaml = r#"
rules:
  - limit_by_param: apikey
    limit_keys:
      - key: k1
        query_per_minute: 60
      - key: k2
        query_per_hour: 5
"#;
        let defs = validate(yaml).unwrap();
        assert_eq!(defs[0].source, KeySource::QueryParam("apikey".into()));
        assert_eq!(defs[0].limits[0].refill_interval, Duration::from_secs(60));
        assert_eq!(defs[0].limits[1].refill_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_missing_rate_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: alice
"#,
            "must be set",
        );
    }

    #[test]
    fn test_multiple_rates_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: alice
        query_per_second: 1
        query_per_hour: 100
"#,
            "only one rate",
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: ""
        query_per_second: 1
"#,
            "key name is required",
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: alice
        query_per_second: 1
      - key: alice
        query_per_second: 2
"#,
            "duplicate key",
        );
    }

    #[test]
    fn test_header_and_param_both_or_neither_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
    limit_by_param: apikey
    limit_keys:
      - key: alice
        query_per_second: 1
"#,
            "exactly one of",
        );
        assert_invalid(
            r#"
rules:
  - limit_by_header: ""
    limit_keys:
      - key: alice
        query_per_second: 1
"#,
            "exactly one of",
        );
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: "bad header"
    limit_keys:
      - key: alice
        query_per_second: 1
"#,
            "invalid header name",
        );
    }

    #[test]
    fn test_no_limit_keys_rejected() {
        assert_invalid(
            r#"
rules:
  - limit_by_header: x-api-key
"#,
            "no limit keys",
        );
    }

    #[test]
    fn test_no_rules_rejected() {
        assert_invalid("rules: []", "no rules");
    }

    #[test]
    fn test_later_rule_failure_rejects_all() {
        let yaml = r#"
rules:
  - limit_by_header: x-api-key
    limit_keys:
      - key: alice
        query_per_second: 1
  - limit_by_param: apikey
    limit_keys:
      - key: bob
"#;
        assert_invalid(yaml, "rule 1");
    }

    #[test]
    fn test_malformed_yaml() {
        let result = RulesConfig::from_yaml("rules: [");
        assert!(matches!(result, Err(KeyrateError::Config(_))));
    }

    #[test]
    fn test_rate_limit_rule_from_key_limit() {
        let limit = KeyLimit {
            key: "alice".into(),
            tokens_per_refill: 10,
            refill_interval: Duration::from_secs(1),
            max_tokens: 10,
        };
        let rule = RateLimitRule::new(RuleId(4), &limit);
        assert_eq!(rule.rule_id, RuleId(4));
        assert_eq!(rule.rate_limit_key, "alice");
        assert_eq!(rule.refill_interval_nanos, 1_000_000_000);
    }

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }
}
