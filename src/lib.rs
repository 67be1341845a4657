//! # flashtree - B-Tree Node Engine for Flash Key-Value Stores
//!
//! flashtree is an embeddable B+tree that keeps variable-length byte keys and
//! values in fixed-size nodes. Nodes are addressed by 64-bit logical ids and
//! read and written through a caller-supplied [`NodeStore`](storage::NodeStore),
//! so the same tree runs on an in-memory store in tests and on a flash or
//! object store in production.
//!
//! - **Prefix-compressed leaves**: adjacent keys share their common prefix
//! - **Sharded node cache**: clock eviction with pinned, dirty-aware slots
//! - **Long values**: values past the inline limit live in overflow chains
//! - **Range cursors**: resumable batches in either direction with seqno filters
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use flashtree::{Btree, BtreeConfig, MemStore, Metadata};
//!
//! let config = BtreeConfig::builder()
//!     .store(Arc::new(MemStore::new()))
//!     .node_size(8100)
//!     .build()?;
//! let tree = Btree::open(config)?;
//!
//! tree.insert(b"user:1", b"alice", &Metadata::default())?;
//! let record = tree.get(b"user:1", &Metadata::default())?;
//! assert_eq!(record.map(|r| r.value), Some(b"alice".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Btree: get / insert / delete / mput /  │
//! │         range_* / range_update / check  │
//! ├─────────────────────────────────────────┤
//! │  OpContext: pins, dirty set, commit     │
//! ├────────────────────┬────────────────────┤
//! │  Leaf codec        │  Interior records  │
//! ├────────────────────┴────────────────────┤
//! │  NodeCache (sharded, clock, budgeted)   │
//! ├─────────────────────────────────────────┤
//! │  NodeStore (caller supplied)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`btree`]: tree operations, leaf codec, range engine, checker
//! - [`cache`]: the node cache
//! - [`config`]: constants, node layout and the config builder
//! - [`error`]: `BtreeError`, `Status`, diagnostics and error policy
//! - [`memory`]: memory budget shared by the cache shards
//! - [`storage`]: node header, meta record, store traits and `MemStore`

#[macro_use]
mod macros;

pub mod btree;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod storage;

pub use btree::{
    Btree, BtreeStats, CheckReport, GetInto, Ioctl, KeyComparator, MetaFlags, Metadata, MputResolver,
    RangeBatch, RangeCursor, RangeFlags, RangeItem, RangeMeta, Record, RupdateMarker,
};
pub use cache::{CacheStats, NodeCache, NodeKey};
pub use config::{BtreeConfig, BtreeConfigBuilder, NodeLayout};
pub use error::{BtreeError, ErrorPolicy, Status};
pub use memory::MemoryBudget;
pub use storage::{MemStore, NodeStore};
