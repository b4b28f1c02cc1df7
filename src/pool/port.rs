//! Ephemeral port pool.

use super::{BoundedPool, PoolError};

pub struct PortPool {
    inner: BoundedPool,
}

impl PortPool {
    pub fn new(start: u16, size: u16) -> Self {
        Self {
            inner: BoundedPool::new(start as u32, size as u32),
        }
    }

    pub fn acquire(&self) -> Result<u16, PoolError> {
        self.inner.acquire().map(|v| v as u16)
    }

    pub fn release(&self, port: u16) -> Result<(), PoolError> {
        self.inner.release(port as u32)
    }

    pub fn remove(&self, port: u16) -> Result<(), PoolError> {
        self.inner.remove(port as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_distinct_ports_within_range() {
        let pool = PortPool::new(61001, 3);
        let ports: Vec<u16> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert!(ports.iter().all(|p| (61001..61004).contains(p)));
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }
}
