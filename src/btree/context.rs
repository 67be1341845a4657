//! # Operation Context
//!
//! Every tree operation runs inside an [`OpContext`]. The context pins each
//! node it touches in the node cache, tracks which nodes were created,
//! modified or deleted, and at the end either commits or aborts:
//!
//! ```text
//! commit:  bump lsn + seal every modified node
//!          + meta node when root/height/ids changed
//!          -> NodeStore::write_nodes(one batch)
//!          -> NodeLogger::log(Create | Modify) per node
//!          -> NodeStore::delete_node + cache delete + log(Delete) per freed node
//!          -> clear dirty bits, drop pins
//!
//!          once write_nodes succeeds the operation is committed; a failed
//!          delete_node only leaks the freed node in the store (warned and
//!          counted in `leaked_nodes`)
//!
//! abort:   delete every modified or created node from the cache so the next
//!          reader reloads the last committed image from the store
//! ```
//!
//! Nodes are shared with the cache as `Arc<MemNode>`. The node buffer sits
//! behind its own `RwLock`. Restructuring writers hold the tree write lock
//! and in-place writers lock a single leaf, so no thread ever waits for a
//! second node lock while holding a node write lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use super::stats::Counters;
use super::tree::TreeInner;
use crate::cache::{CacheRef, EvictionHandler, NodeCache, NodeKey};
use crate::config::{NodeLayout, META_NODE_ID};
use crate::error::{BtreeError, Level};
use crate::storage::node::{seal, verify};
use crate::storage::{DeleteFlags, MetaRecord, NodeEvent, NodeHeader, NodeKind, NodeStore};

/// In-memory copy of one node.
#[derive(Debug)]
pub(crate) struct MemNode {
    pub id: u64,
    pub raw: bool,
    pub data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl MemNode {
    fn new(id: u64, raw: bool, data: Box<[u8]>) -> Self {
        Self {
            id,
            raw,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> Result<NodeKind> {
        NodeHeader::from_bytes(&self.data.read())?.kind()
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.kind()? == NodeKind::Leaf)
    }

    pub fn level(&self) -> Result<u8> {
        Ok(NodeHeader::from_bytes(&self.data.read())?.level())
    }

    pub fn nkeys(&self) -> Result<usize> {
        Ok(NodeHeader::from_bytes(&self.data.read())?.nkeys() as usize)
    }
}

pub(crate) type NodeRef = Arc<MemNode>;
pub(crate) type TreeCache = NodeCache<NodeKey, NodeRef, WriteBack>;
type Pin<'t> = CacheRef<'t, NodeKey, NodeRef, WriteBack>;

/// Writes dirty nodes back to the store when the cache evicts them.
pub(crate) struct WriteBack {
    store: Arc<dyn NodeStore>,
}

impl WriteBack {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }
}

impl EvictionHandler<NodeKey, NodeRef> for WriteBack {
    fn on_evict(&self, key: &NodeKey, node: &NodeRef, dirty: bool) -> Result<()> {
        tracing::trace!(node = key.id, dirty, "evicting node");
        if !dirty && !node.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut image = node.data.read().to_vec();
        seal(&mut image)?;
        self.store
            .write_nodes(&[(key.id, &image)])
            .wrap_err(BtreeError::Io {
                op: "write_nodes",
                node: key.id,
            })
    }
}

/// Pins, bookkeeping and the working tree state of one operation.
pub(crate) struct OpContext<'t> {
    tree: &'t TreeInner,
    pub state: TreeState,
    committed: TreeState,
    pins: Vec<Pin<'t>>,
    nodes: HashMap<NodeKey, NodeRef>,
    modified: Vec<NodeKey>,
    modified_set: HashSet<NodeKey>,
    created: HashSet<NodeKey>,
    deleted: Vec<(NodeKey, DeleteFlags)>,
}

/// Root location and id allocation, persisted in the meta node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeState {
    pub root: u64,
    pub height: usize,
    pub next_id: u64,
    pub node_count: u64,
    pub meta_lsn: u64,
}

impl<'t> OpContext<'t> {
    pub fn new(tree: &'t TreeInner, state: TreeState) -> Self {
        Self {
            tree,
            state,
            committed: state,
            pins: Vec::new(),
            nodes: HashMap::new(),
            modified: Vec::new(),
            modified_set: HashSet::new(),
            created: HashSet::new(),
            deleted: Vec::new(),
        }
    }

    pub fn tree(&self) -> &'t TreeInner {
        self.tree
    }

    pub fn layout(&self) -> &'t NodeLayout {
        &self.tree.layout
    }

    fn key(&self, id: u64, raw: bool) -> NodeKey {
        NodeKey::new(self.tree.config.cguid, id, raw)
    }

    /// Returns tree node `id`, loading it on a cache miss.
    pub fn node(&mut self, id: u64) -> Result<NodeRef> {
        self.acquire(id, false)
    }

    /// Returns overflow node `id`, loading it on a cache miss.
    pub fn raw_node(&mut self, id: u64) -> Result<NodeRef> {
        self.acquire(id, true)
    }

    fn acquire(&mut self, id: u64, raw: bool) -> Result<NodeRef> {
        let key = self.key(id, raw);
        if let Some(node) = self.nodes.get(&key) {
            return Ok(Arc::clone(node));
        }
        let pin = match self.tree.cache.get(&key) {
            Some(pin) => pin,
            None => self.load(key)?,
        };
        let node = Arc::clone(pin.value());
        self.pins.push(pin);
        self.nodes.insert(key, Arc::clone(&node));
        Ok(node)
    }

    fn load(&self, key: NodeKey) -> Result<Pin<'t>> {
        let _stripe = self.tree.load_lock(key.id);
        let store = &self.tree.config.store;
        let data = store
            .read_node(key.id)
            .wrap_err(BtreeError::Io {
                op: "read_node",
                node: key.id,
            })?
            .ok_or_else(|| {
                BtreeError::corruption(
                    "node reference",
                    format!("node {} is referenced but missing from the store", key.id),
                )
            })?;
        let kind = verify(&data, key.id, self.tree.layout.node_size)?;
        crate::ensure_node!(
            kind.is_raw() == key.raw,
            "node kind",
            "node {} is {:?} but was referenced as {}",
            key.id,
            kind,
            if key.raw { "overflow" } else { "a tree node" }
        );

        let node = Arc::new(MemNode::new(key.id, key.raw, data));
        let cache: &'t TreeCache = &self.tree.cache;
        if let Some(pin) = cache.create(key, node)? {
            return Ok(pin);
        }
        cache.get(&key).ok_or_else(|| {
            BtreeError::corruption("node cache", format!("node {} vanished while loading", key.id))
                .into()
        })
    }

    /// Allocates a fresh logical id and an empty node of `kind`.
    pub fn create_node(&mut self, kind: NodeKind, level: u8) -> Result<NodeRef> {
        let id = self.state.next_id;
        let node_size = self.tree.layout.node_size;
        let mut data = self
            .tree
            .config
            .store
            .create_node(id, node_size)
            .wrap_err(BtreeError::Io {
                op: "create_node",
                node: id,
            })?;
        crate::ensure_node!(
            data.len() == node_size,
            "node size",
            "store returned {} bytes for node {}, expected {}",
            data.len(),
            id,
            node_size
        );
        NodeHeader::init(&mut data, kind, level, id)?;
        self.state.next_id += 1;
        self.state.node_count += 1;

        let key = self.key(id, kind.is_raw());
        let node = Arc::new(MemNode::new(id, key.raw, data));
        let pin = self
            .tree
            .cache
            .create(key, Arc::clone(&node))?
            .ok_or_else(|| {
                BtreeError::corruption("logical id", format!("new node {} is already cached", id))
            })?;
        self.pins.push(pin);
        self.nodes.insert(key, Arc::clone(&node));
        self.created.insert(key);
        self.mark_modified(&node);
        Ok(node)
    }

    pub fn mark_modified(&mut self, node: &NodeRef) {
        let key = self.key(node.id, node.raw);
        if self.modified_set.insert(key) {
            self.modified.push(key);
            node.dirty.store(true, Ordering::Release);
            self.tree.cache.mark_dirty(&key);
        }
    }

    /// Frees `node` at commit.
    pub fn delete_node(&mut self, node: &NodeRef, flags: DeleteFlags) {
        let key = self.key(node.id, node.raw);
        self.deleted.push((key, flags));
        self.state.node_count = self.state.node_count.saturating_sub(1);
    }

    pub fn is_dirty(&self) -> bool {
        !self.modified.is_empty() || !self.deleted.is_empty() || self.state != self.committed
    }

    /// Persists the operation's changes and returns the new committed state.
    pub fn commit(mut self) -> Result<TreeState> {
        if !self.is_dirty() {
            return Ok(self.state);
        }
        match self.write_batch() {
            Ok(()) => {}
            Err(e) => {
                let state = self.committed;
                self.abort();
                tracing::debug!(root = state.root, "commit failed, changes discarded");
                return Err(e);
            }
        }

        // The batch and meta image are durable: nothing below may fail the
        // operation, or memory and store would disagree.
        let tree = self.tree;
        for key in &self.modified {
            if self.is_deleted(key) {
                continue;
            }
            let event = if self.created.contains(key) {
                NodeEvent::Create
            } else {
                NodeEvent::Modify
            };
            let lsn = self
                .nodes
                .get(key)
                .and_then(|node| NodeHeader::from_bytes(&node.data.read()).ok().map(|h| h.lsn()))
                .unwrap_or(0);
            tree.config.logger.log(event, key.id, lsn);
        }

        for (key, flags) in &self.deleted {
            if !self.created.contains(key) {
                let freed = tree
                    .config
                    .store
                    .delete_node(key.id, *flags)
                    .wrap_err(BtreeError::Io {
                        op: "delete_node",
                        node: key.id,
                    });
                if let Err(e) = freed {
                    Counters::bump(&tree.counters.leaked_nodes);
                    tree.config.diagnostics.message(
                        Level::Warn,
                        &format!("{:#}; node {} is unreachable and leaked in the store", e, key.id),
                    );
                }
            }
            tree.cache.delete(key);
            tree.config.logger.log(NodeEvent::Delete, key.id, 0);
        }

        for key in &self.modified {
            if let Some(node) = self.nodes.get(key) {
                node.dirty.store(false, Ordering::Release);
            }
            tree.cache.clear_dirty(key);
        }
        Counters::bump(&tree.counters.commits);
        Ok(self.state)
    }

    fn is_deleted(&self, key: &NodeKey) -> bool {
        self.deleted.iter().any(|(k, _)| k == key)
    }

    fn write_batch(&mut self) -> Result<()> {
        let live: Vec<NodeKey> = self
            .modified
            .iter()
            .filter(|k| !self.is_deleted(k))
            .copied()
            .collect();

        for key in &live {
            let node = self.node_for(key)?;
            let mut data = node.data.write();
            let header = NodeHeader::from_bytes_mut(&mut data)?;
            header.set_lsn(header.lsn() + 1);
            seal(&mut data)?;
        }

        let meta_image = if self.state != self.committed {
            self.state.meta_lsn += 1;
            Some(self.meta_image()?)
        } else {
            None
        };

        let guards: Vec<_> = live
            .iter()
            .map(|key| self.node_for(key).map(|node| (key.id, node)))
            .collect::<Result<_>>()?;
        let images: Vec<_> = guards.iter().map(|(id, node)| (*id, node.data.read())).collect();
        let mut batch: Vec<(u64, &[u8])> = images.iter().map(|(id, data)| (*id, &data[..])).collect();
        if let Some(meta) = &meta_image {
            batch.push((META_NODE_ID, &meta[..]));
        }
        if batch.is_empty() {
            return Ok(());
        }

        tracing::trace!(nodes = batch.len(), "writing commit batch");
        self.tree
            .config
            .store
            .write_nodes(&batch)
            .wrap_err(BtreeError::Io {
                op: "write_nodes",
                node: batch[0].0,
            })
    }

    fn node_for(&self, key: &NodeKey) -> Result<NodeRef> {
        self.nodes.get(key).cloned().ok_or_else(|| {
            BtreeError::corruption("node cache", format!("modified node {} is not pinned", key.id))
                .into()
        })
    }

    fn meta_image(&self) -> Result<Box<[u8]>> {
        let layout = &self.tree.layout;
        let mut record = MetaRecord::new(layout.node_size, layout.max_key_size);
        record.set_root(self.state.root);
        record.set_next_id(self.state.next_id);
        record.set_node_count(self.state.node_count);
        record.set_height(self.state.height);

        let mut data = vec![0u8; layout.node_size].into_boxed_slice();
        record.write_node(&mut data, self.state.meta_lsn)?;
        seal(&mut data)?;
        Ok(data)
    }

    /// Drops every change made by the operation.
    pub fn abort(self) {
        let tree = self.tree;
        for key in self.modified.iter().chain(self.created.iter()) {
            if let Some(node) = self.nodes.get(key) {
                node.dirty.store(false, Ordering::Release);
            }
            tree.cache.clear_dirty(key);
            tree.cache.delete(key);
        }
        if !self.modified.is_empty() {
            Counters::bump(&tree.counters.aborts);
            tracing::debug!(nodes = self.modified.len(), "aborted operation");
        }
    }
}
