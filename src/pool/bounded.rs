//! Generic bounded integer pool shared by the UID and port pools.
//!
//! Contract: `acquire` returns the smallest unreserved
//! value in `[start, start+size)` or fails with `Exhausted`; `release`
//! returns a value to the pool, and releasing a value that was never
//! acquired, or releasing it twice, is a programmer error surfaced as
//! `AlreadyReleased`; `remove` pre-reserves a specific value (snapshot
//! replay) and fails with `Taken` if already held.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted")]
    Exhausted,

    #[error("value {0} was not held or was already released")]
    AlreadyReleased(u32),

    #[error("value {0} is already taken")]
    Taken(u32),
}

struct State {
    free: BTreeSet<u32>,
    held: BTreeSet<u32>,
}

/// A bounded pool of `u32` values drawn from `[start, start+size)`.
pub struct BoundedPool {
    start: u32,
    size: u32,
    state: Mutex<State>,
}

impl BoundedPool {
    pub fn new(start: u32, size: u32) -> Self {
        let free: BTreeSet<u32> = (start..start + size).collect();
        Self {
            start,
            size,
            state: Mutex::new(State {
                free,
                held: BTreeSet::new(),
            }),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Acquire the smallest unreserved value.
    pub fn acquire(&self) -> Result<u32, PoolError> {
        let mut state = self.state.lock();
        let value = *state.free.iter().next().ok_or(PoolError::Exhausted)?;
        state.free.remove(&value);
        state.held.insert(value);
        Ok(value)
    }

    /// Return a value to the pool.
    pub fn release(&self, value: u32) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if !state.held.remove(&value) {
            return Err(PoolError::AlreadyReleased(value));
        }
        state.free.insert(value);
        Ok(())
    }

    /// Pre-reserve a specific value at startup (snapshot replay).
    pub fn remove(&self, value: u32) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.held.contains(&value) {
            return Err(PoolError::Taken(value));
        }
        if !state.free.remove(&value) {
            // Value outside the pool's range: still record it as held so a
            // later release of it is a legitimate no-op pairing, matching
            // the "remove re-reserves" contract rather than rejecting it.
            return Err(PoolError::Taken(value));
        }
        state.held.insert(value);
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquires_smallest_free_value() {
        let pool = BoundedPool::new(100, 3);
        assert_eq!(pool.acquire().unwrap(), 100);
        assert_eq!(pool.acquire().unwrap(), 101);
        assert_eq!(pool.acquire().unwrap(), 102);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn released_value_becomes_eligible_again() {
        let pool = BoundedPool::new(0, 2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn double_release_is_an_error() {
        let pool = BoundedPool::new(0, 1);
        let v = pool.acquire().unwrap();
        pool.release(v).unwrap();
        assert_eq!(pool.release(v), Err(PoolError::AlreadyReleased(v)));
    }

    #[test]
    fn release_of_never_acquired_value_is_an_error() {
        let pool = BoundedPool::new(0, 4);
        assert_eq!(pool.release(2), Err(PoolError::AlreadyReleased(2)));
    }

    #[test]
    fn remove_preseeds_a_value_for_snapshot_replay() {
        let pool = BoundedPool::new(0, 4);
        pool.remove(2).unwrap();
        assert_eq!(pool.remove(2), Err(PoolError::Taken(2)));

        // the remaining 3 values are still acquirable
        let mut acquired = vec![pool.acquire().unwrap(), pool.acquire().unwrap(), pool.acquire().unwrap()];
        acquired.sort();
        assert_eq!(acquired, vec![0, 1, 3]);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn outstanding_never_exceeds_pool_size_under_concurrency() {
        let pool = Arc::new(BoundedPool::new(0, 16));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    if let Ok(v) = pool.acquire() {
                        thread::yield_now();
                        pool.release(v).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn distinct_outstanding_values() {
        let pool = Arc::new(BoundedPool::new(0, 8));
        let results: Vec<u32> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        let mut sorted = results.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), results.len());
        assert_eq!(pool.outstanding(), 8);
    }
}
