//! # Tree Configuration
//!
//! Everything a tree needs at open time lives in [`BtreeConfig`]: geometry
//! (node size, max key size, min keys per node), cache sizing, and the
//! embedder's callbacks held as `Arc<dyn Trait>`. A config is built once,
//! validated by [`BtreeConfigBuilder::build`], and shared by the tree for
//! its whole life.
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric defaults and limits with dependency documentation
//! - [`builder`]: the fluent [`BtreeConfigBuilder`]
//!
//! ## Derived Layout
//!
//! Geometry determines how much of a value can live inline in a leaf. A
//! leaf must hold `2 * min_keys + 1` entries of maximal size, so that a
//! full leaf always splits into two halves that each keep `min_keys`
//! entries:
//!
//! ```text
//! usable      = node_size - NODE_HEADER_SIZE
//! per_entry   = usable / (2 * min_keys + 1)
//! max_inline  = per_entry - LEAF_INDEX_STRIDE - MAX_ENTRY_META_SIZE - max_key_size
//!
//! defaults: usable 8048, per_entry 894, max_inline 705
//! ```
//!
//! Values longer than `max_inline` go to overflow chains. Interior nodes use
//! fixed records of `INTERIOR_RECORD_FIXED + max_key_size` bytes and must fit
//! `2 * min_keys + 1` of them.

pub mod builder;
pub mod constants;

use std::fmt;
use std::sync::Arc;

use eyre::{ensure, Result};

pub use builder::BtreeConfigBuilder;
pub use constants::*;

use crate::btree::KeyComparator;
use crate::error::{Diagnostics, ErrorPolicy};
use crate::memory::MemoryBudget;
use crate::storage::{NodeLogger, NodeStore, SeqnoSource};

#[derive(Clone)]
pub struct BtreeConfig {
    pub node_size: usize,
    pub max_key_size: usize,
    pub min_keys_per_node: usize,
    pub cache_entries: usize,
    pub cache_partitions: usize,
    /// Pinned nodes the cache may hold before an operation fails with
    /// `NoNodeRefs`. `None` lets a fully pinned cache grow without bound.
    pub max_pinned_nodes: Option<usize>,
    pub cguid: u64,
    pub error_policy: ErrorPolicy,
    pub store: Arc<dyn NodeStore>,
    pub comparator: Arc<dyn KeyComparator>,
    pub logger: Arc<dyn NodeLogger>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub seqno: Arc<dyn SeqnoSource>,
    pub memory_budget: Option<Arc<MemoryBudget>>,
}

impl BtreeConfig {
    pub fn builder() -> BtreeConfigBuilder {
        BtreeConfigBuilder::new()
    }

    pub fn layout(&self) -> Result<NodeLayout> {
        NodeLayout::derive(self.node_size, self.max_key_size, self.min_keys_per_node)
    }
}

impl fmt::Debug for BtreeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeConfig")
            .field("node_size", &self.node_size)
            .field("max_key_size", &self.max_key_size)
            .field("min_keys_per_node", &self.min_keys_per_node)
            .field("cache_entries", &self.cache_entries)
            .field("cache_partitions", &self.cache_partitions)
            .field("max_pinned_nodes", &self.max_pinned_nodes)
            .field("cguid", &self.cguid)
            .field("error_policy", &self.error_policy)
            .finish_non_exhaustive()
    }
}

/// Per-tree sizes derived from the configured geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub node_size: usize,
    pub max_key_size: usize,
    pub min_keys: usize,
    pub max_inline: usize,
    pub interior_capacity: usize,
    pub overflow_payload: usize,
}

impl NodeLayout {
    pub fn derive(node_size: usize, max_key_size: usize, min_keys: usize) -> Result<Self> {
        ensure!(
            (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size),
            "node size {} outside [{}, {}]",
            node_size,
            MIN_NODE_SIZE,
            MAX_NODE_SIZE
        );
        ensure!(max_key_size > 0, "max key size must be positive");
        ensure!(min_keys > 0, "min keys per node must be positive");

        let usable = node_size - NODE_HEADER_SIZE;
        let fanout = 2 * min_keys + 1;
        let per_entry = usable / fanout;
        let fixed = LEAF_INDEX_STRIDE + MAX_ENTRY_META_SIZE + max_key_size;
        ensure!(
            per_entry >= fixed + OVERFLOW_PTR_SIZE,
            "{} byte nodes cannot hold {} entries with {} byte keys",
            node_size,
            fanout,
            max_key_size
        );

        let interior_capacity = usable / (INTERIOR_RECORD_FIXED + max_key_size);
        ensure!(
            interior_capacity >= fanout,
            "{} byte interior nodes hold {} separators of {} bytes, need {}",
            node_size,
            interior_capacity,
            max_key_size,
            fanout
        );

        Ok(Self {
            node_size,
            max_key_size,
            min_keys,
            max_inline: per_entry - fixed,
            interior_capacity,
            overflow_payload: usable,
        })
    }
}
