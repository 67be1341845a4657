//! # Memory Budget Management
//!
//! Optional byte budget for the node cache. Without a budget the cache is
//! bounded only by its entry count and grows past it when every entry is
//! pinned. With a budget, growth past the limit is refused and surfaces as
//! `OutOfMemory` to the operation that needed the node.
//!
//! ```text
//! +------------------------------------------------+
//! |              MemoryBudget (limit)              |
//! +------------------------------------------------+
//! | shard 0 | shard 1 | ... | shard N-1 |  free    |
//! | node_size bytes charged per resident entry     |
//! +------------------------------------------------+
//! ```
//!
//! ```rust,ignore
//! let config = BtreeConfig::builder()
//!     .memory_budget(Arc::new(MemoryBudget::with_limit(16 * 1024 * 1024)))
//!     .build()?;
//! ```

mod budget;

pub use budget::{BudgetStats, MemoryBudget, MemoryError};
