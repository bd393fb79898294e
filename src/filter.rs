//! Request classification and the rate-limited response.
//!
//! A [`RuleFilter`] pulls the caller's key out of a request and decides
//! whether the request is subject to its rule at all. Requests carrying no
//! key, or a key the rule does not list, pass through untouched.

use std::borrow::Cow;
use std::collections::HashSet;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};

use crate::ratelimit::{RuleDefinition, RuleId};

/// Body of every rate-limited response.
pub const RATE_LIMITED_BODY: &str = "Too many requests,rate_limited\n";

/// Where a rule finds the rate limit key on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// A request header
    Header(HeaderName),
    /// A query string parameter
    QueryParam(String),
}

impl KeySource {
    /// Extract the candidate key, if the request carries one.
    pub fn extract<'a, B>(&self, request: &'a Request<B>) -> Option<Cow<'a, str>> {
        match self {
            // Non-ASCII header bytes are kept, not treated as a missing key
            KeySource::Header(name) => request
                .headers()
                .get(name)
                .map(|value| String::from_utf8_lossy(value.as_bytes())),
            KeySource::QueryParam(name) => query_param(request.uri().query()?, name),
        }
    }
}

/// First value of `name` in a query string.
fn query_param<'a>(query: &'a str, name: &str) -> Option<Cow<'a, str>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if percent_decode(key)? != name {
                return None;
            }
            percent_decode(value)
        })
}

/// Decode `application/x-www-form-urlencoded` text. `None` if malformed.
fn percent_decode(input: &str) -> Option<Cow<'_, str>> {
    if !input.contains(|c: char| c == '%' || c == '+') {
        return Some(Cow::Borrowed(input));
    }

    let mut bytes = Vec::with_capacity(input.len());
    let mut rest = input.as_bytes();
    while let Some((&b, tail)) = rest.split_first() {
        match b {
            b'+' => {
                bytes.push(b' ');
                rest = tail;
            }
            b'%' => {
                let hex = tail.get(..2).filter(|h| h.iter().all(u8::is_ascii_hexdigit))?;
                let hex = std::str::from_utf8(hex).ok()?;
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
                rest = &tail[2..];
            }
            _ => {
                bytes.push(b);
                rest = tail;
            }
        }
    }
    String::from_utf8(bytes).ok().map(Cow::Owned)
}

/// Decision for one request.
#[derive(Debug)]
pub enum Action {
    /// Let the request through.
    Continue,
    /// Answer with this response; do not read the body or forward upstream.
    Reject(Response<String>),
}

impl Action {
    pub fn is_continue(&self) -> bool {
        matches!(self, Action::Continue)
    }
}

/// The 429 response sent to rate-limited callers.
pub fn too_many_requests() -> Response<String> {
    let mut response = Response::new(RATE_LIMITED_BODY.to_string());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Classifies requests for one registered rule.
#[derive(Debug, Clone)]
pub struct RuleFilter {
    rule_id: RuleId,
    source: KeySource,
    keys: HashSet<String>,
}

impl RuleFilter {
    pub fn new(rule_id: RuleId, definition: &RuleDefinition) -> Self {
        Self {
            rule_id,
            source: definition.source.clone(),
            keys: definition.limits.iter().map(|l| l.key.clone()).collect(),
        }
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    /// The rate limit key of `request`, if it is one this rule limits.
    pub fn classify<'a, B>(&self, request: &'a Request<B>) -> Option<Cow<'a, str>> {
        let key = self.source.extract(request)?;
        self.keys.contains(key.as_ref()).then_some(key)
    }
}
