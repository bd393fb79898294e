//! In-process shared store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{SharedStore, StoreError, Version};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    version: Version,
}

/// A [`SharedStore`] held in memory and shared between workers via `Arc`.
///
/// Each key carries its own version counter, starting at 1 on first write and
/// bumped on every successful write. The shard lock taken by the entry API
/// makes the version check and the write a single atomic step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        self.slots
            .get(key)
            .map(|slot| (slot.value.clone(), slot.version))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: &[u8], expected: Option<Version>) -> Result<(), StoreError> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let Some(expected) = expected {
                    if slot.version != expected {
                        trace!(
                            key = %key,
                            expected = %expected,
                            current = %slot.version,
                            "Rejected stale write"
                        );
                        return Err(StoreError::VersionConflict(key.to_string()));
                    }
                }
                slot.value = value.to_vec();
                slot.version = slot.version.next();
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                vacant.insert(Slot {
                    value: value.to_vec(),
                    version: Version::new(1),
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(
            store.get("absent").unwrap_err(),
            StoreError::NotFound("absent".to_string())
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_unconditional_create_then_read() {
        let store = MemoryStore::new();
        store.set_u64("k", 7, None).unwrap();

        let (value, version) = store.get_u64("k").unwrap();
        assert_eq!(value, 7);
        assert_eq!(version, Version::new(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_versioned_write_bumps_version() {
        let store = MemoryStore::new();
        store.set_u64("k", 1, None).unwrap();
        let (_, v1) = store.get("k").unwrap();

        store.set_u64("k", 2, Some(v1)).unwrap();
        let (value, v2) = store.get_u64("k").unwrap();

        assert_eq!(value, 2);
        assert!(v2 > v1);
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        store.set_u64("k", 10, None).unwrap();
        let (_, stale) = store.get("k").unwrap();

        // Another writer lands first
        store.set_u64("k", 9, Some(stale)).unwrap();

        let err = store.set_u64("k", 9, Some(stale)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get_u64("k").unwrap().0, 9);
    }

    #[test]
    fn test_versioned_write_to_missing_key() {
        let store = MemoryStore::new();
        let err = store.set_u64("k", 1, Some(Version::new(1))).unwrap_err();
        assert_eq!(err, StoreError::NotFound("k".to_string()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_writers_single_winner() {
        let store = MemoryStore::new();
        store.set_u64("k", 0, None).unwrap();
        let (_, version) = store.get("k").unwrap();

        let wins: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = &store;
                    s.spawn(move || store.set_u64("k", i, Some(version)).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(wins, 1);
    }
}
