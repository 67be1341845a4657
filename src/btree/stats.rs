//! # Tree Statistics
//!
//! Operation and restructuring counters kept as relaxed atomics, plus a
//! point-in-time [`BtreeStats`] snapshot that folds in the cache counters
//! and the tree shape.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheStats;

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(crate) struct Counters {
            $(pub $field: AtomicU64,)*
        }

        /// Counter values at the time of the snapshot.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct OpCounts {
            $(pub $field: u64,)*
        }

        impl Counters {
            pub fn snapshot(&self) -> OpCounts {
                OpCounts {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    gets,
    inserts,
    updates,
    sets,
    deletes,
    mput_objects,
    range_items,
    range_updates,
    splits,
    merges,
    shifts,
    root_grows,
    root_collapses,
    restarts,
    overflow_writes,
    commits,
    aborts,
    in_place_writes,
    leaked_nodes,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BtreeStats {
    pub ops: OpCounts,
    pub cache: CacheStats,
    pub height: usize,
    pub node_count: u64,
    pub root: u64,
}
