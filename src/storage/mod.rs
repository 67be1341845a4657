//! # Storage Interfaces
//!
//! The engine never touches a storage medium itself. Node persistence, node
//! event logging and sequence number allocation are supplied by the embedder
//! as trait objects held in [`BtreeConfig`](crate::config::BtreeConfig):
//!
//! ```text
//! Btree ──> OpContext ──commit──> NodeStore::write_nodes(batch)
//!   │                         └──> NodeLogger::log(event, id, lsn)
//!   ├──> NodeStore::read_node(id)        on cache miss
//!   └──> SeqnoSource::next_seqno()      per written entry
//! ```
//!
//! [`MemStore`] is the bundled in-memory store. It keeps sealed node images
//! in a hash map, so a tree can be dropped and reopened against the same
//! store.
//!
//! Store errors are passed through unchanged, wrapped with
//! [`BtreeError::Io`](crate::error::BtreeError) context naming the operation
//! and node.

mod mem_store;
pub mod meta;
pub mod node;

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use eyre::Result;

pub use mem_store::{MemStore, StoreStats};
pub use meta::MetaRecord;
pub use node::{NodeFlags, NodeHeader, NodeKind};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeleteFlags: u32 {
        /// The node belonged to an overflow chain.
        const OVERFLOW = 0x1;
        /// The node was freed by a merge or root collapse.
        const RESTRUCTURE = 0x2;
    }
}

/// Persistence callbacks for fixed-size node images.
pub trait NodeStore: Send + Sync {
    /// Returns a buffer for a brand new node. The engine initializes it.
    fn create_node(&self, id: u64, node_size: usize) -> Result<Box<[u8]>> {
        let _ = id;
        Ok(vec![0u8; node_size].into_boxed_slice())
    }

    /// Reads a node image, `None` when the id was never written.
    fn read_node(&self, id: u64) -> Result<Option<Box<[u8]>>>;

    /// Persists a batch of sealed node images. Called once per operation.
    fn write_nodes(&self, nodes: &[(u64, &[u8])]) -> Result<()>;

    fn flush_node(&self, id: u64) -> Result<()>;

    fn delete_node(&self, id: u64, flags: DeleteFlags) -> Result<()>;

    /// Takes back a buffer the engine no longer needs.
    fn free_buffer(&self, buf: Box<[u8]>) {
        drop(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Create,
    Modify,
    Delete,
}

/// Receives one event per node touched by a committed operation.
pub trait NodeLogger: Send + Sync {
    fn log(&self, event: NodeEvent, id: u64, lsn: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl NodeLogger for NoopLogger {
    fn log(&self, _event: NodeEvent, _id: u64, _lsn: u64) {}
}

pub trait SeqnoSource: Send + Sync {
    fn next_seqno(&self) -> u64;
}

/// Process-local monotonically increasing sequence numbers.
#[derive(Debug)]
pub struct AtomicSeqno {
    next: AtomicU64,
}

impl AtomicSeqno {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for AtomicSeqno {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SeqnoSource for AtomicSeqno {
    fn next_seqno(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_seqno_is_monotonic() {
        let seq = AtomicSeqno::starting_at(10);
        assert_eq!(seq.next_seqno(), 10);
        assert_eq!(seq.next_seqno(), 11);
        assert_eq!(seq.peek(), 12);
    }

    #[test]
    fn atomic_seqno_unique_across_threads() {
        use std::sync::Arc;

        let seq = Arc::new(AtomicSeqno::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..1000).map(|_| seq.next_seqno()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
