//! UID pool — reserves and releases unique user-id values.

use super::{BoundedPool, PoolError};

pub struct UidPool {
    inner: BoundedPool,
}

impl UidPool {
    pub fn new(start: u32, size: u32) -> Self {
        Self {
            inner: BoundedPool::new(start, size),
        }
    }

    pub fn acquire(&self) -> Result<u32, PoolError> {
        self.inner.acquire()
    }

    pub fn release(&self, uid: u32) -> Result<(), PoolError> {
        self.inner.release(uid)
    }

    pub fn remove(&self, uid: u32) -> Result<(), PoolError> {
        self.inner.remove(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let pool = UidPool::new(10000, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
        pool.release(a).unwrap();
        assert_eq!(pool.acquire().unwrap(), a);
    }
}
