//! Resource pools: counting semaphores gating commands that share a
//! scarce resource (linker slots, memory-hungry tools).

use std::sync::{Condvar, Mutex};

/// A bounded counting semaphore.  A pool without a capacity is
/// unlimited and skips locking entirely.
#[derive(Debug)]
pub struct ResourcePool {
    name: String,
    inner: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    available: Mutex<usize>,
    cv: Condvar,
    capacity: usize,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        ResourcePool {
            name: name.into(),
            inner: Some(Inner {
                available: Mutex::new(capacity),
                cv: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn unlimited(name: impl Into<String>) -> Self {
        ResourcePool {
            name: name.into(),
            inner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.as_ref().map(|i| i.capacity)
    }

    /// Blocks until a slot is free.  The slot is held until the returned
    /// guard drops; no command ever holds two pools at once.
    pub fn acquire(&self) -> PoolGuard<'_> {
        if let Some(inner) = &self.inner {
            let mut available = inner.available.lock().unwrap();
            while *available == 0 {
                available = inner.cv.wait(available).unwrap();
            }
            *available -= 1;
        }
        PoolGuard { pool: self }
    }

    fn release(&self) {
        if let Some(inner) = &self.inner {
            let mut available = inner.available.lock().unwrap();
            *available += 1;
            drop(available);
            inner.cv.notify_one();
        }
    }
}

pub struct PoolGuard<'a> {
    pool: &'a ResourcePool,
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}
