//! # B-tree Core
//!
//! [`Btree`] owns one tree: its configuration, node cache, committed root
//! state and counters. Every public operation runs inside an
//! [`OpContext`](super::context::OpContext) under the tree lock:
//!
//! ```text
//! get / get_into / flush / range_next / check   state.read()  + OpContext (no writes)
//! insert / update / set / delete, in place      state.read()  + leaf write lock -> write leaf
//! insert / update / set / delete, restructuring state.write() + OpContext -> commit
//! mput                                          state.write() per batch -> commit
//! ```
//!
//! A point write first tries the in-place path: under the tree read lock it
//! descends to the leaf, write-locks it and applies the change when the
//! entry fits and no overflow chain is created or freed (deletes: when the
//! leaf stays at or above `min_keys`). The leaf image is written straight to
//! the store while its lock is held, and restored if the store fails. When
//! the change needs a split, a merge or overflow nodes, the write retries
//! under the tree write lock with the full descent below.
//!
//! ## Insert Path (top-down preemptive split)
//!
//! ```text
//! root needs room?  ──yes──> new root above it, split old root (height + 1)
//!      │
//!      v
//! interior node N ── pick child C for key
//!      │   C needs room? ──yes──> split C, add separator to N, re-pick child
//!      v
//! leaf: insert / replace entry (overflow chain first when value > max_inline)
//! ```
//!
//! "Needs room" is exact for leaves: the codec plans the real splice of the
//! entry about to be written. A child is never entered unless the write will
//! fit, and every interior node on the path has a free separator slot by the
//! time a child below it splits. When the half picked after a split still
//! cannot take the entry, or a parent filled up, the descent restarts from
//! the root (bounded by `MAX_INSERT_RESTARTS`).
//!
//! ## Commit Semantics
//!
//! An operation that fails with an expected outcome (`KeyExists`,
//! `KeyNotFound`, `StaleSeqno`, ...) still commits the splits it performed
//! on the way down: the tree is consistent either way. Any other error
//! aborts the operation and drops its modified nodes from the cache.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use eyre::{ensure, Report, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard, RwLock};

use super::compare::KeyComparator;
use super::context::{NodeRef, OpContext, TreeCache, TreeState, WriteBack};
use super::interior::{self, InteriorNode, InteriorNodeMut};
use super::leaf::{self, EntryRef, EntryValue, KeyBuf, LeafNode, LeafNodeMut, SearchResult};
use super::metadata::{GetInto, MetaFlags, Metadata, MputDecision, MputResolver, Record};
use super::overflow;
use super::rebalance;
use super::stats::{BtreeStats, Counters};
use crate::cache::NodeCache;
use crate::config::{
    BtreeConfig, NodeLayout, FIRST_NODE_ID, LOAD_LOCK_STRIPES, MAX_INSERT_RESTARTS, MAX_VALUE_SIZE,
    META_NODE_ID,
};
use crate::error::{is_clean, BtreeError, ErrorPolicy, Level, Status};
use crate::storage::node::{seal, verify};
use crate::storage::{MetaRecord, NodeEvent, NodeHeader, NodeKind};

pub(crate) struct TreeInner {
    pub config: BtreeConfig,
    pub layout: NodeLayout,
    pub cache: TreeCache,
    pub state: RwLock<TreeState>,
    pub counters: Counters,
    policy: AtomicU8,
    load_locks: Box<[Mutex<()>]>,
}

impl TreeInner {
    pub fn cmp(&self) -> &dyn KeyComparator {
        &*self.config.comparator
    }

    /// Held across a store read and cache insert of node `id`, and across
    /// an in-place store write of it, so a load never caches an image older
    /// than one already written.
    pub fn load_lock(&self, id: u64) -> MutexGuard<'_, ()> {
        self.load_locks[(id % self.load_locks.len() as u64) as usize].lock()
    }

    pub fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Routes a failed operation's error through the diagnostics sink.
    fn report(&self, e: Report) -> Report {
        match Status::of(&e) {
            Status::Corruption => {
                self.config.diagnostics.message(Level::Error, &format!("{:#}", e));
                if self.policy() == ErrorPolicy::Abort {
                    std::process::abort();
                }
            }
            Status::Io | Status::Failure => {
                self.config.diagnostics.message(Level::Error, &format!("{:#}", e));
            }
            Status::OutOfMemory | Status::NoNodeRefs | Status::OutOfStorage => {
                self.config.diagnostics.message(Level::Warn, &format!("{:#}", e));
            }
            _ => {}
        }
        e
    }

    pub(crate) fn seqno_for(&self, meta: &Metadata) -> u64 {
        if meta.flags.contains(MetaFlags::UPDATE_USE_SEQNO) {
            meta.seqno
        } else {
            self.config.seqno.next_seqno()
        }
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.layout.max_key_size {
            return Err(BtreeError::ObjectTooBig {
                what: "key",
                len: key.len(),
                max: self.layout.max_key_size,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(BtreeError::ObjectTooBig {
                what: "value",
                len: value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    SetErrorPolicy(ErrorPolicy),
    /// Total cached nodes; evicts down to the new limit where possible.
    SetCacheLimit(usize),
    /// Asks the store to make every node of the tree durable.
    FlushAll,
    ResetStats,
}

/// A flash-resident key-value B-tree. Cheap to clone; clones share the tree.
#[derive(Clone)]
pub struct Btree {
    inner: Arc<TreeInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Insert,
    Update,
    Set,
    Tombstone,
    Mput,
}

pub(crate) struct WriteRequest<'r> {
    pub key: &'r [u8],
    pub value: &'r [u8],
    pub seqno: u64,
    pub mode: WriteMode,
    pub meta: &'r Metadata,
    pub resolver: Option<&'r dyn MputResolver>,
}

impl WriteRequest<'_> {
    fn tombstone(&self) -> bool {
        self.mode == WriteMode::Tombstone
    }

    /// The entry as it will be laid out, with a placeholder chain head when
    /// the value goes to overflow nodes.
    fn entry(&self, layout: &NodeLayout, head: u64) -> EntryRef<'_> {
        let value = if self.tombstone() {
            EntryValue::Inline(&[])
        } else if self.value.len() > layout.max_inline {
            EntryValue::Overflow {
                node: head,
                len: self.value.len() as u32,
            }
        } else {
            EntryValue::Inline(self.value)
        };
        EntryRef {
            key: self.key,
            value,
            seqno: self.seqno,
            tombstone: self.tombstone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafOutcome {
    Written,
    Skipped,
    NoRoom,
}

/// The leaf a write ended in, and the exclusive upper bound of its keys.
pub(crate) struct Landing {
    pub leaf: NodeRef,
    pub upper: Option<KeyBuf>,
}

/// Value bytes of a stored entry, detached from the node buffer.
#[derive(Debug, Clone)]
pub(crate) enum StoredValue {
    Inline(Vec<u8>),
    Overflow { head: u64, len: usize },
}

impl StoredValue {
    pub fn of(value: &EntryValue<'_>) -> Self {
        match value {
            EntryValue::Inline(v) => StoredValue::Inline(v.to_vec()),
            EntryValue::Overflow { node, len } => StoredValue::Overflow {
                head: *node,
                len: *len as usize,
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StoredValue::Inline(v) => v.len(),
            StoredValue::Overflow { len, .. } => *len,
        }
    }

    pub fn materialize(self, ctx: &mut OpContext<'_>) -> Result<Vec<u8>> {
        match self {
            StoredValue::Inline(v) => Ok(v),
            StoredValue::Overflow { head, len } => overflow::read_chain(ctx, head, len),
        }
    }
}

struct Existing {
    tombstone: bool,
    seqno: u64,
    overflow: Option<u64>,
    value: Option<StoredValue>,
}

impl Btree {
    /// Opens the tree stored in `config.store`, creating an empty one (a
    /// single empty root leaf) when the store has no meta node.
    pub fn open(config: BtreeConfig) -> Result<Self> {
        let layout = config.layout()?;
        let cache = NodeCache::with_budget(
            config.cache_entries,
            config.cache_partitions,
            WriteBack::new(Arc::clone(&config.store)),
            config.memory_budget.clone(),
            layout.node_size,
        )?;
        cache.set_pin_limit(config.max_pinned_nodes);

        let existing = config
            .store
            .read_node(META_NODE_ID)
            .wrap_err(BtreeError::Io {
                op: "read_node",
                node: META_NODE_ID,
            })?;
        let state = match &existing {
            Some(data) => {
                verify(data, META_NODE_ID, layout.node_size)?;
                let record = MetaRecord::from_node(data)?;
                ensure!(
                    record.node_size() == layout.node_size && record.max_key() == layout.max_key_size,
                    "tree was created with {} byte nodes and {} byte keys, opened with {} and {}",
                    record.node_size(),
                    record.max_key(),
                    layout.node_size,
                    layout.max_key_size
                );
                TreeState {
                    root: record.root(),
                    height: record.height(),
                    next_id: record.next_id(),
                    node_count: record.node_count(),
                    meta_lsn: NodeHeader::from_bytes(data)?.lsn(),
                }
            }
            None => TreeState {
                root: 0,
                height: 0,
                next_id: FIRST_NODE_ID,
                node_count: 0,
                meta_lsn: 0,
            },
        };

        if existing.is_some() {
            check_state(&state)?;
        }

        let policy = AtomicU8::new(config.error_policy.as_u8());
        let tree = Self {
            inner: Arc::new(TreeInner {
                config,
                layout,
                cache,
                state: RwLock::new(state),
                counters: Counters::default(),
                policy,
                load_locks: (0..LOAD_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            }),
        };

        if existing.is_none() {
            tree.write_op(|ctx| {
                let root = ctx.create_node(NodeKind::Leaf, 0)?;
                ctx.state.root = root.id;
                ctx.state.height = 1;
                Ok(())
            })?;
            tracing::debug!(node_size = layout.node_size, "created empty tree");
        } else {
            tracing::debug!(root = state.root, height = state.height, "opened tree");
        }
        Ok(tree)
    }

    pub(crate) fn inner(&self) -> &TreeInner {
        &self.inner
    }

    pub fn config(&self) -> &BtreeConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.inner.layout
    }

    pub fn height(&self) -> usize {
        self.inner.state.read().height
    }

    pub(crate) fn read_op<T>(&self, f: impl FnOnce(&mut OpContext<'_>) -> Result<T>) -> Result<T> {
        let inner = &*self.inner;
        let guard = inner.state.read();
        let mut ctx = OpContext::new(inner, *guard);
        let result = f(&mut ctx);
        drop(ctx);
        drop(guard);
        result.map_err(|e| inner.report(e))
    }

    pub(crate) fn write_op<T>(&self, f: impl FnOnce(&mut OpContext<'_>) -> Result<T>) -> Result<T> {
        let inner = &*self.inner;
        let mut guard = inner.state.write();
        let mut ctx = OpContext::new(inner, *guard);
        let outcome = match f(&mut ctx) {
            Ok(v) => ctx.commit().map(|state| {
                *guard = state;
                v
            }),
            Err(e) if is_clean(&e) => match ctx.commit() {
                Ok(state) => {
                    *guard = state;
                    Err(e)
                }
                Err(commit_err) => Err(commit_err),
            },
            Err(e) => {
                ctx.abort();
                Err(e)
            }
        };
        drop(guard);
        outcome.map_err(|e| inner.report(e))
    }

    /// Returns the live entry for `key` if it passes the read filters.
    pub fn get(&self, key: &[u8], meta: &Metadata) -> Result<Option<Record>> {
        self.inner.check_key(key)?;
        Counters::bump(&self.inner.counters.gets);
        self.read_op(|ctx| {
            let node = find_leaf(ctx, key)?;
            let found = {
                let data = node.data.read();
                let leaf = LeafNode::from_node(&data)?;
                match leaf.find_key(key, ctx.tree().cmp())? {
                    SearchResult::Found(i) => {
                        let e = leaf.entry_at(i)?;
                        (!e.tombstone && meta.admits(e.seqno))
                            .then(|| (e.seqno, StoredValue::of(&e.value)))
                    }
                    SearchResult::NotFound(_) => None,
                }
            };
            match found {
                Some((seqno, value)) => Ok(Some(Record {
                    key: key.to_vec(),
                    value: value.materialize(ctx)?,
                    seqno,
                })),
                None => Ok(None),
            }
        })
    }

    /// Like [`get`](Self::get), copying the value into `buf` when the
    /// metadata says a buffer is provided.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8], meta: &Metadata) -> Result<Option<GetInto>> {
        let Some(record) = self.get(key, meta)? else {
            return Ok(None);
        };
        if !meta.flags.contains(MetaFlags::BUFFER_PROVIDED) {
            return Ok(Some(GetInto::Allocated(record)));
        }
        let len = record.value.len();
        if len <= buf.len() {
            buf[..len].copy_from_slice(&record.value);
            return Ok(Some(GetInto::InBuffer {
                len,
                seqno: record.seqno,
            }));
        }
        if meta.flags.contains(MetaFlags::ALLOC_IF_TOO_SMALL) {
            return Ok(Some(GetInto::Allocated(record)));
        }
        Err(BtreeError::BufferTooSmall {
            needed: len,
            provided: buf.len(),
        }
        .into())
    }

    /// Adds `key`; fails with `KeyExists` when a live entry is present.
    pub fn insert(&self, key: &[u8], value: &[u8], meta: &Metadata) -> Result<()> {
        Counters::bump(&self.inner.counters.inserts);
        self.write(key, value, meta, WriteMode::Insert)
    }

    /// Replaces a live entry; fails with `KeyNotFound` when there is none.
    pub fn update(&self, key: &[u8], value: &[u8], meta: &Metadata) -> Result<()> {
        Counters::bump(&self.inner.counters.updates);
        self.write(key, value, meta, WriteMode::Update)
    }

    /// Inserts or replaces.
    pub fn set(&self, key: &[u8], value: &[u8], meta: &Metadata) -> Result<()> {
        Counters::bump(&self.inner.counters.sets);
        self.write(key, value, meta, WriteMode::Set)
    }

    fn write(&self, key: &[u8], value: &[u8], meta: &Metadata, mode: WriteMode) -> Result<()> {
        self.inner.check_key(key)?;
        self.inner.check_value(value)?;
        let req = WriteRequest {
            key,
            value,
            seqno: self.inner.seqno_for(meta),
            mode,
            meta,
            resolver: None,
        };
        if self.read_op(|ctx| write_in_place(ctx, &req))? {
            return Ok(());
        }
        self.write_op(|ctx| write_entry(ctx, &req).map(|_| ()))
    }

    /// Removes `key`, or turns it into a tombstone under `INSERT_TOMBSTONE`.
    pub fn delete(&self, key: &[u8], meta: &Metadata) -> Result<()> {
        self.inner.check_key(key)?;
        Counters::bump(&self.inner.counters.deletes);
        if meta.flags.contains(MetaFlags::INSERT_TOMBSTONE)
            && !meta.flags.contains(MetaFlags::FORCE_DELETE)
        {
            let req = WriteRequest {
                key,
                value: &[],
                seqno: self.inner.seqno_for(meta),
                mode: WriteMode::Tombstone,
                meta,
                resolver: None,
            };
            if self.read_op(|ctx| write_in_place(ctx, &req))? {
                return Ok(());
            }
            return self.write_op(|ctx| write_entry(ctx, &req).map(|_| ()));
        }
        if self.read_op(|ctx| rebalance::delete_in_place(ctx, key, meta))? {
            return Ok(());
        }
        self.write_op(|ctx| rebalance::delete_entry(ctx, key, meta))
    }

    /// Asks the store to make the leaf holding `key` durable.
    pub fn flush(&self, key: &[u8]) -> Result<()> {
        self.inner.check_key(key)?;
        let ids = self.read_op(|ctx| {
            let node = find_leaf(ctx, key)?;
            let head = {
                let data = node.data.read();
                let leaf = LeafNode::from_node(&data)?;
                match leaf.find_key(key, ctx.tree().cmp())? {
                    SearchResult::Found(i) => leaf.entry_at(i)?.value.overflow_node(),
                    SearchResult::NotFound(_) => return Err(BtreeError::KeyNotFound.into()),
                }
            };
            let mut ids = vec![node.id];
            if let Some(head) = head {
                ids.extend(overflow::chain_ids(ctx, head)?);
            }
            Ok(ids)
        })?;
        self.flush_ids(&ids)
    }

    fn flush_ids(&self, ids: &[u64]) -> Result<()> {
        for &id in ids {
            self.inner
                .config
                .store
                .flush_node(id)
                .wrap_err(BtreeError::Io {
                    op: "flush_node",
                    node: id,
                })
                .map_err(|e| self.inner.report(e))?;
        }
        Ok(())
    }

    pub fn ioctl(&self, cmd: Ioctl) -> Result<()> {
        match cmd {
            Ioctl::SetErrorPolicy(policy) => {
                self.inner.policy.store(policy.as_u8(), Ordering::Relaxed);
            }
            Ioctl::SetCacheLimit(entries) => {
                let evicted = self.inner.cache.set_max_entries(entries)?;
                tracing::debug!(entries, evicted, "resized node cache");
            }
            Ioctl::FlushAll => {
                let mut ids = self.read_op(|ctx| super::check::node_ids(ctx))?;
                ids.push(META_NODE_ID);
                self.flush_ids(&ids)?;
            }
            Ioctl::ResetStats => {
                self.inner.counters.reset();
                self.inner.cache.reset_stats();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BtreeStats {
        let state = *self.inner.state.read();
        BtreeStats {
            ops: self.inner.counters.snapshot(),
            cache: self.inner.cache.stats(),
            height: state.height,
            node_count: state.node_count,
            root: state.root,
        }
    }
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.inner.state.read();
        f.debug_struct("Btree")
            .field("root", &state.root)
            .field("height", &state.height)
            .field("node_count", &state.node_count)
            .finish_non_exhaustive()
    }
}

/// Child position, child id and the separator bounding it from above.
pub(crate) fn route(
    ctx: &OpContext<'_>,
    node: &NodeRef,
    key: &[u8],
) -> Result<(usize, u64, Option<KeyBuf>)> {
    let data = node.data.read();
    let view = InteriorNode::from_node(&data, ctx.layout().max_key_size)?;
    let (pos, child) = view.find_child(key, ctx.tree().cmp())?;
    let upper = if pos < view.nkeys() {
        Some(KeyBuf::from_slice(view.key_at(pos)?))
    } else {
        None
    };
    Ok((pos, child, upper))
}

/// Descends to the leaf whose key range covers `key`.
pub(crate) fn find_leaf(ctx: &mut OpContext<'_>, key: &[u8]) -> Result<NodeRef> {
    let mut node = ctx.node(ctx.state.root)?;
    let mut depth = 1;
    while !node.is_leaf()? {
        let (_, child, _) = route(ctx, &node, key)?;
        node = ctx.node(child)?;
        depth += 1;
        crate::ensure_node!(
            depth <= ctx.state.height,
            "level uniformity",
            "descent passed recorded height {}",
            ctx.state.height
        );
    }
    Ok(node)
}

/// Writes one entry with top-down preemptive splitting.
pub(crate) fn write_entry(ctx: &mut OpContext<'_>, req: &WriteRequest<'_>) -> Result<(LeafOutcome, Landing)> {
    for attempt in 0..MAX_INSERT_RESTARTS {
        if let Some(done) = try_write(ctx, req)? {
            return Ok(done);
        }
        Counters::bump(&ctx.tree().counters.restarts);
        tracing::trace!(attempt, "restarting insert descent");
    }
    Err(BtreeError::corruption(
        "insert restarts",
        format!("no room found for a {} byte entry", req.key.len() + req.value.len()),
    )
    .into())
}

fn try_write(ctx: &mut OpContext<'_>, req: &WriteRequest<'_>) -> Result<Option<(LeafOutcome, Landing)>> {
    let root = ctx.node(ctx.state.root)?;
    if needs_room(ctx, &root, req)? {
        grow_root(ctx, &root)?;
    }

    let mut node = ctx.node(ctx.state.root)?;
    let mut upper: Option<KeyBuf> = None;
    loop {
        if node.is_leaf()? {
            return match apply_at_leaf(ctx, &node, req)? {
                LeafOutcome::NoRoom => Ok(None),
                outcome => Ok(Some((outcome, Landing { leaf: node, upper }))),
            };
        }

        let (pos, child_id, child_upper) = route(ctx, &node, req.key)?;
        let child = ctx.node(child_id)?;
        if needs_room(ctx, &child, req)? {
            if node.nkeys()? >= ctx.layout().interior_capacity {
                return Ok(None);
            }
            split_child(ctx, &node, pos, &child)?;
            continue;
        }
        if child_upper.is_some() {
            upper = child_upper;
        }
        node = child;
    }
}

/// True when `node` must split before the write can pass through it.
fn needs_room(ctx: &OpContext<'_>, node: &NodeRef, req: &WriteRequest<'_>) -> Result<bool> {
    let data = node.data.read();
    match NodeHeader::from_bytes(&data)?.kind()? {
        NodeKind::Interior => {
            Ok(InteriorNode::from_node(&data, ctx.layout().max_key_size)?.is_full())
        }
        NodeKind::Leaf => {
            let leaf = LeafNode::from_node(&data)?;
            let entry = req.entry(ctx.layout(), 0);
            match leaf.find_key(req.key, ctx.tree().cmp())? {
                SearchResult::Found(i) => {
                    let stored = leaf.entry_at(i)?;
                    let fails = match req.mode {
                        WriteMode::Insert => !stored.tombstone,
                        WriteMode::Update | WriteMode::Tombstone => stored.tombstone,
                        WriteMode::Set | WriteMode::Mput => false,
                    };
                    if fails {
                        return Ok(false);
                    }
                    leaf.is_full_replace(&entry, i)
                }
                SearchResult::NotFound(i) => {
                    let fails = match req.mode {
                        WriteMode::Update | WriteMode::Tombstone => true,
                        WriteMode::Set => req.meta.flags.contains(MetaFlags::OLD_SEQNO_MUST_MATCH),
                        WriteMode::Insert | WriteMode::Mput => false,
                    };
                    if fails {
                        return Ok(false);
                    }
                    leaf.is_full(&entry, i)
                }
            }
        }
        kind => Err(BtreeError::corruption(
            "node kind",
            format!("{:?} node {} on a tree path", kind, node.id),
        )
        .into()),
    }
}

fn grow_root(ctx: &mut OpContext<'_>, old_root: &NodeRef) -> Result<()> {
    let level = old_root.level()?;
    ensure!(level < u8::MAX, "tree height limit reached");
    let root = ctx.create_node(NodeKind::Interior, level + 1)?;
    NodeHeader::from_bytes_mut(&mut root.data.write())?.set_rightmost(old_root.id);
    ctx.state.root = root.id;
    ctx.state.height += 1;
    split_child(ctx, &root, 0, old_root)?;
    Counters::bump(&ctx.tree().counters.root_grows);
    tracing::debug!(root = root.id, height = ctx.state.height, "grew tree");
    Ok(())
}

/// Splits `child`, the child at `pos` of `parent`, into itself and a new
/// right sibling.
pub(crate) fn split_child(
    ctx: &mut OpContext<'_>,
    parent: &NodeRef,
    pos: usize,
    child: &NodeRef,
) -> Result<()> {
    let max_key = ctx.layout().max_key_size;
    let level = child.level()?;
    let (sibling, boundary) = if child.is_leaf()? {
        let sibling = ctx.create_node(NodeKind::Leaf, 0)?;
        let (boundary, old_next) = {
            let mut from_data = child.data.write();
            let mut to_data = sibling.data.write();
            let mut from = LeafNodeMut::from_node(&mut from_data)?;
            let mut to = LeafNodeMut::from_node(&mut to_data)?;
            let boundary = leaf::split(&mut from, &mut to)?;
            let old_next = from.header_mut()?.next();
            from.header_mut()?.set_next(sibling.id);
            let header = to.header_mut()?;
            header.set_prev(child.id);
            header.set_next(old_next);
            (boundary, old_next)
        };
        if old_next != 0 {
            let next = ctx.node(old_next)?;
            NodeHeader::from_bytes_mut(&mut next.data.write())?.set_prev(sibling.id);
            ctx.mark_modified(&next);
        }
        (sibling, boundary)
    } else {
        let sibling = ctx.create_node(NodeKind::Interior, level)?;
        let boundary = {
            let mut from_data = child.data.write();
            let mut to_data = sibling.data.write();
            let mut from = InteriorNodeMut::from_node(&mut from_data, max_key)?;
            let mut to = InteriorNodeMut::from_node(&mut to_data, max_key)?;
            interior::split(&mut from, &mut to)?
        };
        (sibling, boundary)
    };

    {
        let mut data = parent.data.write();
        InteriorNodeMut::from_node(&mut data, max_key)?
            .insert_child_split(pos, &boundary, child.id, sibling.id)?;
    }
    ctx.mark_modified(child);
    ctx.mark_modified(parent);
    Counters::bump(&ctx.tree().counters.splits);
    tracing::debug!(node = child.id, sibling = sibling.id, level, "split node");
    Ok(())
}

/// Applies `req` to the leaf `node`, which covers the request key.
/// `NoRoom` means the entry does not fit and nothing was changed.
pub(crate) fn apply_at_leaf(
    ctx: &mut OpContext<'_>,
    node: &NodeRef,
    req: &WriteRequest<'_>,
) -> Result<LeafOutcome> {
    let outcome = {
        let mut data = node.data.write();
        apply_to_leaf(ctx, &mut data, req, false)?
    };
    if outcome == LeafOutcome::Written {
        ctx.mark_modified(node);
    }
    Ok(outcome)
}

/// Applies `req` to the write-locked leaf image `data`. With `in_place` set
/// the write must not touch any other node: a value going to or coming from
/// an overflow chain yields `NoRoom` like a full leaf does.
fn apply_to_leaf(
    ctx: &mut OpContext<'_>,
    data: &mut [u8],
    req: &WriteRequest<'_>,
    in_place: bool,
) -> Result<LeafOutcome> {
    let cmp = ctx.tree().cmp();
    let (found, existing) = {
        let leaf = LeafNode::from_node(data)?;
        let found = leaf.find_key(req.key, cmp)?;
        let existing = match found {
            SearchResult::Found(i) => {
                let e = leaf.entry_at(i)?;
                let value = (req.mode == WriteMode::Mput && !e.tombstone)
                    .then(|| StoredValue::of(&e.value));
                Some(Existing {
                    tombstone: e.tombstone,
                    seqno: e.seqno,
                    overflow: e.value.overflow_node(),
                    value,
                })
            }
            SearchResult::NotFound(_) => None,
        };
        (found, existing)
    };

    let live = existing.as_ref().is_some_and(|e| !e.tombstone);
    match req.mode {
        WriteMode::Insert if live => return Err(BtreeError::KeyExists.into()),
        WriteMode::Update | WriteMode::Tombstone if !live => {
            return Err(BtreeError::KeyNotFound.into())
        }
        WriteMode::Set
            if existing.is_none() && req.meta.flags.contains(MetaFlags::OLD_SEQNO_MUST_MATCH) =>
        {
            return Err(BtreeError::KeyNotFound.into())
        }
        _ => {}
    }
    if let Some(e) = &existing {
        if matches!(req.mode, WriteMode::Update | WriteMode::Set | WriteMode::Tombstone) {
            req.meta.check_old_seqno(e.seqno)?;
        }
    }

    let layout = *ctx.layout();
    let spills = !req.tombstone() && req.value.len() > layout.max_inline;
    let old_chain = existing.as_ref().and_then(|e| e.overflow);
    if in_place && (spills || old_chain.is_some()) {
        return Ok(LeafOutcome::NoRoom);
    }

    if let (Some(resolver), Some(e)) = (req.resolver, &existing) {
        if let Some(stored) = e.value.clone() {
            let old = Record {
                key: req.key.to_vec(),
                value: stored.materialize(ctx)?,
                seqno: e.seqno,
            };
            if resolver.resolve(req.key, &old, req.value) == MputDecision::Skip {
                return Ok(LeafOutcome::Skipped);
            }
        }
    }

    {
        let leaf = LeafNode::from_node(data)?;
        let entry = req.entry(&layout, 0);
        let full = match found {
            SearchResult::Found(i) => leaf.is_full_replace(&entry, i)?,
            SearchResult::NotFound(i) => leaf.is_full(&entry, i)?,
        };
        if full {
            return Ok(LeafOutcome::NoRoom);
        }
    }

    let head = if spills {
        overflow::write_chain(ctx, req.value)?
    } else {
        0
    };
    {
        let mut leaf = LeafNodeMut::from_node(data)?;
        let entry = req.entry(&layout, head);
        match found {
            SearchResult::Found(i) => leaf.replace_key_index(&entry, i)?,
            SearchResult::NotFound(i) => leaf.insert_key_index(&entry, i)?,
        };
    }
    if let Some(old) = old_chain {
        overflow::delete_chain(ctx, old)?;
    }
    Ok(LeafOutcome::Written)
}

/// Applies `req` to its leaf under the tree read lock. Returns `false`,
/// with nothing changed, when the write needs the tree write lock.
fn write_in_place(ctx: &mut OpContext<'_>, req: &WriteRequest<'_>) -> Result<bool> {
    let node = find_leaf(ctx, req.key)?;
    let mut data = node.data.write();
    let before = data.to_vec();
    let outcome = match apply_to_leaf(ctx, &mut data, req, true) {
        Ok(outcome) => outcome,
        Err(e) => {
            data.copy_from_slice(&before);
            return Err(e);
        }
    };
    match outcome {
        LeafOutcome::NoRoom => Ok(false),
        LeafOutcome::Skipped => Ok(true),
        LeafOutcome::Written => {
            persist_in_place(ctx, &node, &mut data, &before)?;
            Ok(true)
        }
    }
}

/// Seals the write-locked leaf image and writes it straight to the store.
/// A store failure puts `before` back, so the cached node matches the store.
pub(crate) fn persist_in_place(
    ctx: &OpContext<'_>,
    node: &NodeRef,
    data: &mut [u8],
    before: &[u8],
) -> Result<()> {
    let tree = ctx.tree();
    let written = (|| -> Result<u64> {
        let header = NodeHeader::from_bytes_mut(data)?;
        let lsn = header.lsn() + 1;
        header.set_lsn(lsn);
        seal(data)?;
        let _stripe = tree.load_lock(node.id);
        tree.config
            .store
            .write_nodes(&[(node.id, &data[..])])
            .wrap_err(BtreeError::Io {
                op: "write_nodes",
                node: node.id,
            })?;
        Ok(lsn)
    })();
    match written {
        Ok(lsn) => {
            tree.config.logger.log(NodeEvent::Modify, node.id, lsn);
            Counters::bump(&tree.counters.in_place_writes);
            tracing::trace!(node = node.id, lsn, "wrote leaf in place");
            Ok(())
        }
        Err(e) => {
            data.copy_from_slice(before);
            Err(e)
        }
    }
}

/// Fails with `Corruption` when the meta record cannot describe a tree.
fn check_state(state: &TreeState) -> Result<()> {
    crate::ensure_node!(
        state.root != META_NODE_ID && state.height > 0 && state.next_id > state.root,
        "meta node",
        "root {} at height {} with next id {}",
        state.root,
        state.height,
        state.next_id
    );
    Ok(())
}
