//! Numeric endpoint ID allocation

use crate::id::{MAX_ENDPOINT_ID, MIN_ENDPOINT_ID};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::debug;

/// Issues and reclaims numeric endpoint IDs.
///
/// `allocate` returns 0 when the pool is exhausted.
pub trait IdAllocator: Send + Sync {
    fn allocate(&self) -> u16;
    fn reuse(&self, id: u16) -> Result<()>;
    fn release(&self, id: u16) -> Result<()>;
    fn reallocate_pool(&self);
}

/// A bounded pool of endpoint IDs. The lowest free ID is leased first.
pub struct IdPool {
    min: u16,
    max: u16,
    available: Mutex<BTreeSet<u16>>,
}

impl IdPool {
    /// Create a pool over `min..=max`
    pub fn new(min: u16, max: u16) -> Self {
        let min = min.max(MIN_ENDPOINT_ID);
        Self {
            min,
            max,
            available: Mutex::new((min..=max).collect()),
        }
    }

    /// Number of IDs currently free
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new(MIN_ENDPOINT_ID, MAX_ENDPOINT_ID)
    }
}

impl IdAllocator for IdPool {
    fn allocate(&self) -> u16 {
        let mut available = self.available.lock();
        match available.pop_first() {
            Some(id) => {
                debug!(endpoint_id = id, "Allocated endpoint ID");
                id
            }
            None => 0,
        }
    }

    fn reuse(&self, id: u16) -> Result<()> {
        if id < self.min {
            return Err(Error::IdReuse(format!("{} < {}", id, self.min)));
        }
        if id > self.max {
            return Err(Error::IdReuse(format!("{} > {}", id, self.max)));
        }
        if !self.available.lock().remove(&id) {
            return Err(Error::IdReuse(format!("endpoint ID {} is already in use", id)));
        }
        debug!(endpoint_id = id, "Reserved endpoint ID");
        Ok(())
    }

    fn release(&self, id: u16) -> Result<()> {
        if id < self.min || id > self.max {
            return Err(Error::IdRelease(id));
        }
        if !self.available.lock().insert(id) {
            return Err(Error::IdRelease(id));
        }
        debug!(endpoint_id = id, "Released endpoint ID");
        Ok(())
    }

    fn reallocate_pool(&self) {
        *self.available.lock() = (self.min..=self.max).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_first() {
        let pool = IdPool::new(1, 3);
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 2);
        assert_eq!(pool.allocate(), 3);
        assert_eq!(pool.allocate(), 0);
    }

    #[test]
    fn test_reuse() {
        let pool = IdPool::new(1, 10);
        assert!(pool.reuse(5).is_ok());
        assert!(pool.reuse(5).is_err());
        assert!(pool.reuse(0).is_err());
        assert!(pool.reuse(11).is_err());
        assert_eq!(pool.available(), 9);
    }

    #[test]
    fn test_release() {
        let pool = IdPool::new(1, 2);
        let id = pool.allocate();
        assert!(pool.release(id).is_ok());
        assert_eq!(pool.release(id), Err(Error::IdRelease(id)));
        assert_eq!(pool.allocate(), id);
    }

    #[test]
    fn test_reallocate_pool() {
        let pool = IdPool::new(1, 2);
        pool.allocate();
        pool.allocate();
        assert_eq!(pool.allocate(), 0);

        pool.reallocate_pool();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocate(), 1);
    }
}
