//! # Config Builder
//!
//! Fluent construction of a [`BtreeConfig`]. Every setting has a default, so
//! `BtreeConfig::builder().build()` yields an in-memory tree with 8100-byte
//! nodes:
//!
//! | Option          | Default                   |
//! |-----------------|---------------------------|
//! | node_size       | `DEFAULT_NODE_SIZE`       |
//! | max_key_size    | `DEFAULT_MAX_KEY_SIZE`    |
//! | min_keys        | `DEFAULT_MIN_KEYS_PER_NODE` |
//! | cache_entries   | `DEFAULT_CACHE_ENTRIES`   |
//! | partitions      | `CACHE_PARTITIONS`        |
//! | max_pinned      | unbounded                 |
//! | store           | fresh `MemStore`          |
//! | comparator      | `BytewiseComparator`      |
//! | logger          | `NoopLogger`              |
//! | diagnostics     | `TracingDiagnostics`      |
//! | seqno           | `AtomicSeqno` from 1      |
//!
//! ```ignore
//! let store = Arc::new(MemStore::new());
//! let tree = Btree::open(
//!     BtreeConfig::builder()
//!         .node_size(4096)
//!         .max_key_size(64)
//!         .store(store.clone())
//!         .build()?,
//! )?;
//! ```

use std::sync::Arc;

use eyre::{ensure, Result};

use super::{BtreeConfig, NodeLayout};
use super::{
    CACHE_PARTITIONS, DEFAULT_CACHE_ENTRIES, DEFAULT_MAX_KEY_SIZE, DEFAULT_MIN_KEYS_PER_NODE,
    DEFAULT_NODE_SIZE,
};
use crate::btree::{BytewiseComparator, KeyComparator};
use crate::error::{Diagnostics, ErrorPolicy, TracingDiagnostics};
use crate::memory::MemoryBudget;
use crate::storage::{AtomicSeqno, MemStore, NodeLogger, NodeStore, NoopLogger, SeqnoSource};

pub struct BtreeConfigBuilder {
    node_size: usize,
    max_key_size: usize,
    min_keys_per_node: usize,
    cache_entries: usize,
    cache_partitions: usize,
    max_pinned_nodes: Option<usize>,
    cguid: u64,
    error_policy: ErrorPolicy,
    store: Option<Arc<dyn NodeStore>>,
    comparator: Option<Arc<dyn KeyComparator>>,
    logger: Option<Arc<dyn NodeLogger>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
    seqno: Option<Arc<dyn SeqnoSource>>,
    memory_budget: Option<Arc<MemoryBudget>>,
}

impl Default for BtreeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BtreeConfigBuilder {
    pub fn new() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            min_keys_per_node: DEFAULT_MIN_KEYS_PER_NODE,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            cache_partitions: CACHE_PARTITIONS,
            max_pinned_nodes: None,
            cguid: 0,
            error_policy: ErrorPolicy::default(),
            store: None,
            comparator: None,
            logger: None,
            diagnostics: None,
            seqno: None,
            memory_budget: None,
        }
    }

    pub fn node_size(mut self, bytes: usize) -> Self {
        self.node_size = bytes;
        self
    }

    pub fn max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    pub fn min_keys_per_node(mut self, n: usize) -> Self {
        self.min_keys_per_node = n;
        self
    }

    /// Total cached nodes across all partitions.
    pub fn cache_entries(mut self, n: usize) -> Self {
        self.cache_entries = n;
        self
    }

    pub fn cache_partitions(mut self, n: usize) -> Self {
        self.cache_partitions = n;
        self
    }

    /// Upper bound on nodes pinned at once. Past it, an operation that
    /// needs another node fails with `NoNodeRefs` instead of growing the
    /// cache.
    pub fn max_pinned_nodes(mut self, n: usize) -> Self {
        self.max_pinned_nodes = Some(n);
        self
    }

    /// Container id folded into every cache key.
    pub fn cguid(mut self, cguid: u64) -> Self {
        self.cguid = cguid;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn NodeLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn seqno(mut self, seqno: Arc<dyn SeqnoSource>) -> Self {
        self.seqno = Some(seqno);
        self
    }

    /// Charges every cached node against `budget`.
    pub fn memory_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.memory_budget = Some(budget);
        self
    }

    pub fn build(self) -> Result<BtreeConfig> {
        NodeLayout::derive(self.node_size, self.max_key_size, self.min_keys_per_node)?;
        ensure!(self.cache_partitions > 0, "cache needs at least one partition");
        ensure!(
            self.cache_entries >= self.cache_partitions,
            "cache of {} entries cannot span {} partitions",
            self.cache_entries,
            self.cache_partitions
        );
        if let Some(limit) = self.max_pinned_nodes {
            ensure!(
                limit >= self.cache_entries,
                "pin limit {} is below the cache capacity of {} entries",
                limit,
                self.cache_entries
            );
        }

        Ok(BtreeConfig {
            node_size: self.node_size,
            max_key_size: self.max_key_size,
            min_keys_per_node: self.min_keys_per_node,
            cache_entries: self.cache_entries,
            cache_partitions: self.cache_partitions,
            max_pinned_nodes: self.max_pinned_nodes,
            cguid: self.cguid,
            error_policy: self.error_policy,
            store: self.store.unwrap_or_else(|| Arc::new(MemStore::new())),
            comparator: self
                .comparator
                .unwrap_or_else(|| Arc::new(BytewiseComparator)),
            logger: self.logger.unwrap_or_else(|| Arc::new(NoopLogger)),
            diagnostics: self
                .diagnostics
                .unwrap_or_else(|| Arc::new(TracingDiagnostics)),
            seqno: self
                .seqno
                .unwrap_or_else(|| Arc::new(AtomicSeqno::default())),
            memory_budget: self.memory_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() -> Result<()> {
        let config = BtreeConfigBuilder::new().build()?;
        assert_eq!(config.node_size, DEFAULT_NODE_SIZE);
        assert_eq!(config.max_key_size, DEFAULT_MAX_KEY_SIZE);
        assert_eq!(config.layout()?.max_inline, 705);
        Ok(())
    }

    #[test]
    fn invalid_geometry_fails_build() {
        assert!(BtreeConfigBuilder::new().node_size(100).build().is_err());
        assert!(BtreeConfigBuilder::new()
            .node_size(1024)
            .max_key_size(400)
            .build()
            .is_err());
    }

    #[test]
    fn cache_must_cover_partitions() {
        assert!(BtreeConfigBuilder::new()
            .cache_entries(4)
            .cache_partitions(8)
            .build()
            .is_err());
        assert!(BtreeConfigBuilder::new()
            .cache_partitions(0)
            .build()
            .is_err());
    }

    #[test]
    fn pin_limit_must_cover_cache() {
        assert!(BtreeConfigBuilder::new()
            .cache_entries(64)
            .max_pinned_nodes(32)
            .build()
            .is_err());
        let config = BtreeConfigBuilder::new()
            .cache_entries(64)
            .max_pinned_nodes(64)
            .build()
            .unwrap();
        assert_eq!(config.max_pinned_nodes, Some(64));
    }
}
