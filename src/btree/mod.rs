//! # B-Tree Core
//!
//! A B+tree over fixed-size nodes addressed by 64-bit logical ids. Leaves
//! hold the entries (prefix compressed, values inline or in overflow
//! chains); interior nodes hold separators and child ids. Every node lives
//! in the shared [`NodeCache`](crate::cache::NodeCache); dirty nodes reach
//! the [`NodeStore`](crate::storage::NodeStore) in one batch when an
//! operation commits, or when the cache evicts them.
//!
//! ## Tree Shape
//!
//! ```text
//!                       meta node (id 0): root, height, next id, node count
//!                           │
//!                    [ interior: s0 s1 ]                level h-1
//!                   /        │         \
//!        [ leaf a ] <──> [ leaf b ] <──> [ leaf c ]     level 0
//!         keys < s0    s0 <= keys < s1   keys >= s1
//! ```
//!
//! Leaves form a doubly linked list used by range queries in both
//! directions.
//!
//! ## Operations
//!
//! | Operation        | Lock          | Path                                   |
//! |------------------|---------------|----------------------------------------|
//! | `get`            | tree read     | descend, read one leaf                 |
//! | `insert`/`set`   | tree read     | descend, rewrite the leaf in place     |
//! |   (restructure)  | tree write    | descend, split full nodes on the way   |
//! | `delete`         | tree read     | descend, remove from the leaf in place |
//! |   (restructure)  | tree write    | descend, remove, rebalance bottom-up   |
//! | `mput`           | tree write    | sorted batches, one descent per leaf   |
//! | `range_next`     | tree read     | descend to the cursor, walk leaf links |
//!
//! In-place writes hold the leaf's own write lock while they change it and
//! write it to the store, so writers on different leaves proceed together
//! and readers of other leaves are not blocked.
//!
//! Each operation runs in an `OpContext` that pins the nodes it touches and
//! collects the ones it modifies. Commit writes them (plus the meta node when
//! the root, height or id counter moved) as one store batch; an error that is
//! not a plain caller-facing condition aborts and drops the modified copies
//! from the cache, leaving the store image untouched.
//!
//! ## Module Map
//!
//! - `compare`: key ordering
//! - `entry`, `leaf`: leaf codec with prefix compression
//! - `interior`: fixed-record interior nodes
//! - `overflow`: value chains for long values
//! - `context`: per-operation pins, dirty tracking, commit and abort
//! - `tree`: open, point operations, insert descent and splits
//! - `rebalance`: delete path, shifts, merges and root collapse
//! - `mput`, `range`, `check`, `stats`

mod check;
mod compare;
mod context;
mod entry;
mod interior;
mod leaf;
mod metadata;
mod mput;
mod overflow;
mod range;
mod rebalance;
mod stats;
mod tree;

pub use check::CheckReport;
pub use compare::{BytewiseComparator, KeyComparator};
pub use interior::{InteriorNode, InteriorNodeMut};
pub use leaf::{encoded_size, EntryRef, EntryValue, KeyBuf, LeafEntry, LeafNode, LeafNodeMut, SearchResult};
pub use metadata::{
    AlwaysOverwrite, GetInto, KeepExisting, MetaFlags, Metadata, MputDecision, MputResolver, RangeFlags,
    RangeMeta, Record,
};
pub use range::{RangeBatch, RangeCursor, RangeItem, RangeUpdate, RupdateMarker};
pub use stats::{BtreeStats, OpCounts};
pub use tree::{Btree, Ioctl};
