//! Shared key-value state with optimistic concurrency.
//!
//! Every worker sees the same store. Writes carry the version that was read,
//! and the store rejects them if another writer got there first. That version
//! check is the only concurrency control the rate limiter relies on.

mod memory;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;

use std::fmt;

use thiserror::Error;

/// Width of every value the rate limiter stores.
pub const VALUE_LEN: usize = 8;

/// Opaque version token handed out by [`SharedStore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Errors returned by a [`SharedStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key has never been written.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The stored version no longer matches the expected one.
    #[error("version conflict on key {0}")]
    VersionConflict(String),

    /// The store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored bytes are not a valid counter.
    #[error("corrupt value under key {key}: expected 8 bytes, found {len}")]
    Corrupt { key: String, len: usize },
}

impl StoreError {
    /// Whether this error only signals that a concurrent writer won.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict(_))
    }
}

/// Capability interface over the host's shared key-value store.
///
/// `set` with `expected = Some(v)` must apply atomically and only if the
/// stored version is still `v`. `expected = None` writes unconditionally and
/// is reserved for first-time creation.
pub trait SharedStore: Send + Sync + fmt::Debug {
    /// Read the raw bytes and current version of `key`.
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError>;

    /// Write `value` under `key` if the version still matches `expected`.
    fn set(&self, key: &str, value: &[u8], expected: Option<Version>) -> Result<(), StoreError>;

    /// Read `key` and decode it as a counter.
    fn get_u64(&self, key: &str) -> Result<(u64, Version), StoreError> {
        let (bytes, version) = self.get(key)?;
        Ok((decode_u64(key, &bytes)?, version))
    }

    /// Encode `value` and write it under `key`.
    fn set_u64(&self, key: &str, value: u64, expected: Option<Version>) -> Result<(), StoreError> {
        self.set(key, &encode_u64(value), expected)
    }
}

impl<S: SharedStore + ?Sized> SharedStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], expected: Option<Version>) -> Result<(), StoreError> {
        (**self).set(key, value, expected)
    }
}

/// Encode a counter as little-endian bytes.
pub fn encode_u64(value: u64) -> [u8; VALUE_LEN] {
    value.to_le_bytes()
}

/// Decode a little-endian counter, rejecting values of the wrong width.
pub fn decode_u64(key: &str, bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; VALUE_LEN] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        len: bytes.len(),
    })?;
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_is_little_endian() {
        assert_eq!(encode_u64(1), [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_u64("k", &[0, 1, 0, 0, 0, 0, 0, 0]).unwrap(), 256);
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let err = decode_u64("k", &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            StoreError::Corrupt {
                key: "k".to_string(),
                len: 3
            }
        );
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_only_version_conflict_is_conflict() {
        assert!(StoreError::VersionConflict("k".into()).is_conflict());
        assert!(!StoreError::NotFound("k".into()).is_conflict());
        assert!(!StoreError::Unavailable("down".into()).is_conflict());
    }
}
