//! Optimistic read-transform-write against the shared store.
//!
//! Initialization, acquisition and refill are all the same loop: read a
//! counter and its version, compute the next value, and write it back only if
//! nobody else wrote in between. They differ in the transform and in how long
//! they are willing to keep losing races.

use tracing::trace;

use crate::store::{SharedStore, StoreError};

/// How many times [`update`] may attempt the read-transform-write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// At most this many attempts. Every failed read or write uses one up.
    Bounded(u32),
    /// Keep going while the only failures are version conflicts.
    Unbounded,
}

impl RetryPolicy {
    fn allows(self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Bounded(max) => attempts < max,
            RetryPolicy::Unbounded => true,
        }
    }
}

/// Result of an [`update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The new value was written.
    Applied { previous: u64, current: u64 },
    /// The transform declined to write after seeing `current`.
    Skipped { current: u64 },
    /// A bounded policy ran out of attempts without a definitive answer.
    Exhausted { attempts: u32 },
}

/// Apply `transform` to the counter at `key` under optimistic concurrency.
///
/// `transform` receives the freshly read value and returns the value to write,
/// or `None` to abstain. Abstaining returns immediately without writing.
///
/// Under [`RetryPolicy::Bounded`] store errors never escape: they consume an
/// attempt, and running out yields [`CasOutcome::Exhausted`]. Under
/// [`RetryPolicy::Unbounded`] only version conflicts are retried; any other
/// read or write error is returned.
pub fn update<S, F>(
    store: &S,
    key: &str,
    policy: RetryPolicy,
    mut transform: F,
) -> Result<CasOutcome, StoreError>
where
    S: SharedStore + ?Sized,
    F: FnMut(u64) -> Option<u64>,
{
    let mut attempts: u32 = 0;

    while policy.allows(attempts) {
        attempts = attempts.saturating_add(1);

        let (current, version) = match store.get_u64(key) {
            Ok(read) => read,
            Err(err) => match policy {
                RetryPolicy::Bounded(_) => {
                    trace!(key = %key, attempt = attempts, error = %err, "CAS read failed");
                    continue;
                }
                RetryPolicy::Unbounded => return Err(err),
            },
        };

        let Some(next) = transform(current) else {
            return Ok(CasOutcome::Skipped { current });
        };

        match store.set_u64(key, next, Some(version)) {
            Ok(()) => {
                trace!(key = %key, attempt = attempts, previous = current, current = next, "CAS applied");
                return Ok(CasOutcome::Applied {
                    previous: current,
                    current: next,
                });
            }
            Err(err) if err.is_conflict() => {
                trace!(key = %key, attempt = attempts, "CAS lost race, retrying");
            }
            Err(err) => match policy {
                RetryPolicy::Bounded(_) => {
                    trace!(key = %key, attempt = attempts, error = %err, "CAS write failed");
                }
                RetryPolicy::Unbounded => return Err(err),
            },
        }
    }

    Ok(CasOutcome::Exhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;

    fn store_with(key: &str, value: u64) -> FlakyStore {
        let store = FlakyStore::new();
        store.inner.set_u64(key, value, None).unwrap();
        store
    }

    #[test]
    fn test_update_applies() {
        let store = MemoryStore::new();
        store.set_u64("k", 5, None).unwrap();

        let outcome = update(&store, "k", RetryPolicy::Bounded(3), |v| Some(v + 1)).unwrap();

        assert_eq!(outcome, CasOutcome::Applied { previous: 5, current: 6 });
        assert_eq!(store.get_u64("k").unwrap().0, 6);
    }

    #[test]
    fn test_abstain_skips_write() {
        let store = store_with("k", 0);

        let outcome = update(&store, "k", RetryPolicy::Bounded(3), |v| v.checked_sub(1)).unwrap();

        assert_eq!(outcome, CasOutcome::Skipped { current: 0 });
        assert_eq!(store.writes(), 0);
        assert_eq!(store.reads(), 1);
    }

    #[test]
    fn test_conflict_rereads_and_recomputes() {
        let store = store_with("k", 10);
        store.race_writes(2);

        let mut seen = Vec::new();
        let outcome = update(&store, "k", RetryPolicy::Bounded(5), |v| {
            seen.push(v);
            Some(v - 1)
        })
        .unwrap();

        assert_eq!(outcome, CasOutcome::Applied { previous: 10, current: 9 });
        assert_eq!(seen, vec![10, 10, 10]);
        assert_eq!(store.reads(), 3);
    }

    #[test]
    fn test_bounded_exhaustion() {
        let store = store_with("k", 10);
        store.race_writes(u32::MAX);

        let outcome = update(&store, "k", RetryPolicy::Bounded(4), |v| Some(v - 1)).unwrap();

        assert_eq!(outcome, CasOutcome::Exhausted { attempts: 4 });
        assert_eq!(store.inner.get_u64("k").unwrap().0, 10);
    }

    #[test]
    fn test_bounded_read_errors_consume_attempts() {
        let store = store_with("k", 3);
        store.fail_reads(2);

        let outcome = update(&store, "k", RetryPolicy::Bounded(3), |v| Some(v - 1)).unwrap();
        assert_eq!(outcome, CasOutcome::Applied { previous: 3, current: 2 });

        store.fail_reads(3);
        let outcome = update(&store, "k", RetryPolicy::Bounded(3), |v| Some(v - 1)).unwrap();
        assert_eq!(outcome, CasOutcome::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_bounded_zero_never_touches_store() {
        let store = store_with("k", 3);
        let outcome = update(&store, "k", RetryPolicy::Bounded(0), |v| Some(v)).unwrap();
        assert_eq!(outcome, CasOutcome::Exhausted { attempts: 0 });
        assert_eq!(store.reads(), 0);
    }

    #[test]
    fn test_unbounded_retries_conflicts() {
        let store = store_with("k", 1);
        store.race_writes(50);

        let outcome = update(&store, "k", RetryPolicy::Unbounded, |v| Some(v + 1)).unwrap();

        assert_eq!(outcome, CasOutcome::Applied { previous: 1, current: 2 });
        assert_eq!(store.reads(), 51);
    }

    #[test]
    fn test_unbounded_aborts_on_read_error() {
        let store = store_with("k", 1);
        store.fail_reads(1);

        let err = update(&store, "k", RetryPolicy::Unbounded, |v| Some(v + 1)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_unbounded_aborts_on_write_error() {
        let store = store_with("k", 1);
        store.fail_writes(1);

        let err = update(&store, "k", RetryPolicy::Unbounded, |v| Some(v + 1)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.inner.get_u64("k").unwrap().0, 1);
    }
}
