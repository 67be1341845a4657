use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{DeleteFlags, NodeStore};
use crate::error::BtreeError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub deletes: u64,
}

/// In-memory [`NodeStore`]. Optionally bounded in node count, in which case a
/// write that would add a node past the bound fails with `OutOfStorage`.
#[derive(Debug, Default)]
pub struct MemStore {
    nodes: Mutex<HashMap<u64, Box<[u8]>>>,
    max_nodes: Option<usize>,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    deletes: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_nodes(max_nodes: usize) -> Self {
        Self {
            max_nodes: Some(max_nodes),
            ..Self::default()
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    /// Mutates a stored image in place. Used to simulate media corruption.
    pub fn tamper(&self, id: u64, f: impl FnOnce(&mut [u8])) -> bool {
        match self.nodes.lock().get_mut(&id) {
            Some(image) => {
                f(image);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl NodeStore for MemStore {
    fn read_node(&self, id: u64) -> Result<Option<Box<[u8]>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.nodes.lock().get(&id).cloned())
    }

    fn write_nodes(&self, batch: &[(u64, &[u8])]) -> Result<()> {
        let mut nodes = self.nodes.lock();

        if let Some(max) = self.max_nodes {
            let added = batch
                .iter()
                .filter(|(id, _)| !nodes.contains_key(id))
                .count();
            if nodes.len() + added > max {
                return Err(BtreeError::OutOfStorage.into());
            }
        }

        for (id, image) in batch {
            match nodes.get_mut(id) {
                Some(existing) if existing.len() == image.len() => existing.copy_from_slice(image),
                _ => {
                    nodes.insert(*id, image.to_vec().into_boxed_slice());
                }
            }
        }
        self.writes.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush_node(&self, _id: u64) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete_node(&self, id: u64, _flags: DeleteFlags) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.nodes.lock().remove(&id);
        Ok(())
    }
}
