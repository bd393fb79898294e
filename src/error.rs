//! Error types for the Keyrate service.

use thiserror::Error;

use crate::ratelimit::RuleId;
use crate::store::StoreError;

/// Main error type for Keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// Configuration files that could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule set that failed validation at load time
    #[error("Invalid rate limit rules: {0}")]
    Validation(String),

    /// A bucket that could not be established in the shared store
    #[error("Failed to initialize bucket for rule {rule_id} key {key:?}: {source}")]
    Initialization {
        rule_id: RuleId,
        key: String,
        #[source]
        source: StoreError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyrateError {
    pub(crate) fn validation(rule: usize, reason: impl std::fmt::Display) -> Self {
        KeyrateError::Validation(format!("rule {}: {}", rule, reason))
    }
}

/// Result type alias for Keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;
