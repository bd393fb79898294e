//! Fault-injecting store used by unit tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{MemoryStore, SharedStore, StoreError, Version};

/// Wraps a [`MemoryStore`] and injects read failures, write failures and
/// lost races on demand.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    racing_writes: AtomicU32,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` reads with `Unavailable`.
    pub fn fail_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with `Unavailable`.
    pub fn fail_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Let a competing writer win before each of the next `n` versioned writes.
    pub fn race_writes(&self, n: u32) {
        self.racing_writes.store(n, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SharedStore for FlakyStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8], expected: Option<Version>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_writes) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        if expected.is_some() && take(&self.racing_writes) {
            // Rewrite the current value so only the version moves
            if let Ok((current, version)) = self.inner.get(key) {
                self.inner.set(key, &current, Some(version))?;
            }
        }
        self.inner.set(key, value, expected)
    }
}
