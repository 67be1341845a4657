//! # flashtree Configuration Constants
//!
//! This module centralizes the numeric limits of the engine, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located and tied together with
//! compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! MAX_NODE_SIZE (32768)
//!       │
//!       ├─> every in-node offset is a u16 (insert_ptr, leaf index records,
//!       │   interior key lengths), so MAX_NODE_SIZE must stay <= u16::MAX
//!       │
//!       └─> DEFAULT_NODE_SIZE (8100) must lie in [MIN_NODE_SIZE, MAX_NODE_SIZE]
//!
//! NODE_HEADER_SIZE (52 bytes, fixed)
//!       │
//!       └─> node usable size (derived at open time: node_size - NODE_HEADER_SIZE)
//!             │
//!             ├─> leaf: (2 * min_keys + 1) maximal entries must fit, each costing
//!             │   LEAF_INDEX_STRIDE + MAX_ENTRY_META_SIZE + max_key + max_inline
//!             │
//!             └─> interior: (2 * min_keys + 1) records of
//!                 INTERIOR_RECORD_FIXED + max_key must fit
//!
//! CACHE_PARTITIONS (16)
//!       │
//!       └─> DEFAULT_CACHE_ENTRIES is split evenly across partitions
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions:
//!
//! 1. `MAX_NODE_SIZE <= u16::MAX` (in-node offsets fit a u16)
//! 2. `MIN_NODE_SIZE <= DEFAULT_NODE_SIZE <= MAX_NODE_SIZE`
//! 3. The default configuration satisfies the per-node fan-out rule above
//! 4. `MIN_COMMON_LENGTH` is at least one byte

/// Default physical node size in bytes.
pub const DEFAULT_NODE_SIZE: usize = 8100;

/// Largest supported node size. Offsets inside a node are stored as u16.
pub const MAX_NODE_SIZE: usize = 32768;

/// Smallest supported node size.
pub const MIN_NODE_SIZE: usize = 512;

/// Size of the fixed node header shared by every node kind.
pub const NODE_HEADER_SIZE: usize = 52;

/// Default maximum key length.
pub const DEFAULT_MAX_KEY_SIZE: usize = 160;

/// Default minimum number of entries held by a non-root node.
pub const DEFAULT_MIN_KEYS_PER_NODE: usize = 4;

/// Shortest shared prefix worth encoding as a prefix reference.
pub const MIN_COMMON_LENGTH: usize = 4;

/// Size of one leaf header index record (`offset: u16`, `meta_off: u16`).
pub const LEAF_INDEX_STRIDE: usize = 4;

/// Sequence number stored with every leaf entry.
pub const SEQNO_SIZE: usize = 8;

/// Widest leaf entry metadata: tag byte, four u32 fields and the seqno.
pub const MAX_ENTRY_META_SIZE: usize = 1 + 4 * 4 + SEQNO_SIZE;

/// Inline bytes of an entry whose value lives in an overflow chain.
pub const OVERFLOW_PTR_SIZE: usize = 8;

/// Fixed part of an interior record: `key_len: u16` and `child: u64`.
pub const INTERIOR_RECORD_FIXED: usize = 2 + 8;

/// Largest value accepted by any write path.
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Logical id of the tree meta node.
pub const META_NODE_ID: u64 = 0;

/// First logical id handed out to tree nodes.
pub const FIRST_NODE_ID: u64 = 1;

/// Deepest tree an operation path stack is sized for before spilling.
pub const PATH_INLINE_DEPTH: usize = 8;

/// Key bytes kept inline in a `KeyBuf` before spilling to the heap.
pub const KEY_INLINE_CAPACITY: usize = 64;

/// Number of independent node cache partitions.
pub const CACHE_PARTITIONS: usize = 16;

/// Default node cache capacity (entries across all partitions).
pub const DEFAULT_CACHE_ENTRIES: usize = 4096;

/// Striped locks ordering cache-miss loads against in-place leaf writes.
pub const LOAD_LOCK_STRIPES: usize = 64;

/// Keys applied per tree write-lock acquisition by `mput`.
pub const MPUT_BATCH_SIZE: usize = 256;

/// Upper bound on restarts of a single top-down insert descent.
pub const MAX_INSERT_RESTARTS: usize = 32;

const _: () = assert!(
    MAX_NODE_SIZE <= u16::MAX as usize,
    "in-node offsets are u16"
);

const _: () = assert!(
    MIN_NODE_SIZE <= DEFAULT_NODE_SIZE && DEFAULT_NODE_SIZE <= MAX_NODE_SIZE,
    "default node size out of range"
);

const _: () = assert!(
    (2 * DEFAULT_MIN_KEYS_PER_NODE + 1)
        * (LEAF_INDEX_STRIDE + MAX_ENTRY_META_SIZE + DEFAULT_MAX_KEY_SIZE + OVERFLOW_PTR_SIZE)
        <= DEFAULT_NODE_SIZE - NODE_HEADER_SIZE,
    "default leaf cannot hold 2 * min_keys + 1 maximal entries"
);

const _: () = assert!(
    (2 * DEFAULT_MIN_KEYS_PER_NODE + 1) * (INTERIOR_RECORD_FIXED + DEFAULT_MAX_KEY_SIZE)
        <= DEFAULT_NODE_SIZE - NODE_HEADER_SIZE,
    "default interior node cannot hold 2 * min_keys + 1 separators"
);

const _: () = assert!(MIN_COMMON_LENGTH >= 1, "prefix threshold must be positive");

const _: () = assert!(
    DEFAULT_CACHE_ENTRIES >= CACHE_PARTITIONS,
    "every cache partition needs at least one slot"
);
