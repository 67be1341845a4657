//! # Memory Budget Implementation
//!
//! Byte accounting for the node cache. The cache charges one node size per
//! resident entry and gives it back when the entry is freed.
//!
//! ## Enforcement
//!
//! 1. **Hard Limit**: an allocation that would exceed the limit fails
//!    immediately with [`MemoryError`]
//! 2. **Thread Safety**: the counter is a single atomic updated with a
//!    compare-exchange loop, so shards never take a shared lock to charge it
//! 3. **Adjustable**: the limit can be raised or lowered at runtime; lowering
//!    it below current usage only refuses new allocations
//!
//! The cache treats a refused allocation as memory pressure: it evicts an
//! unpinned entry and retries once before reporting `OutOfMemory`.

use std::sync::atomic::{AtomicUsize, Ordering};

use eyre::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    pub limit: usize,
    pub used: usize,
    pub refused: usize,
}

impl BudgetStats {
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.used as f64 / self.limit as f64) * 100.0
    }
}

impl std::fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "used:{}/{},refused:{}", self.used, self.limit, self.refused)
    }
}

#[derive(Debug)]
pub struct MemoryError {
    pub requested: usize,
    pub available: usize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory budget exceeded: requested {} bytes but only {} available",
            self.requested, self.available
        )
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug)]
pub struct MemoryBudget {
    limit: AtomicUsize,
    used: AtomicUsize,
    refused: AtomicUsize,
}

impl MemoryBudget {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }

    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.available() >= bytes
    }

    pub fn allocate(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        loop {
            let current = self.used.load(Ordering::Acquire);
            let limit = self.limit();
            let new_used = current + bytes;

            if new_used > limit {
                self.refused.fetch_add(1, Ordering::Relaxed);
                bail!(MemoryError {
                    requested: bytes,
                    available: limit.saturating_sub(current),
                });
            }

            match self.used.compare_exchange_weak(
                current,
                new_used,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }

        loop {
            let current = self.used.load(Ordering::Acquire);
            let new_value = current.saturating_sub(bytes);

            match self.used.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn try_allocate(&self, bytes: usize) -> bool {
        self.allocate(bytes).is_ok()
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            limit: self.limit(),
            used: self.used(),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}
