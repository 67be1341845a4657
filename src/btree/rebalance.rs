//! # Delete and Rebalance
//!
//! Deletes descend once from the root recording a [`PathLevel`] per interior
//! node: the node, the child slot taken, and the separator bounding that
//! child from below. After the entry is removed the path is unwound bottom-up:
//!
//! ```text
//! node below min_keys?
//!   ├─ left sibling has surplus   -> shift its tail right,  parent sep[pos-1] = new boundary
//!   ├─ right sibling has surplus  -> shift its head left,   parent sep[pos]   = new boundary
//!   └─ otherwise merge            -> pos > 0:  node into left,  drop sep[pos-1] + node
//!                                    pos == 0: node into right (leaves) or
//!                                              right into node (interiors), drop sep[0]
//!      and continue with the parent, which lost one separator
//! ```
//!
//! When the root is an interior node left with no separators, its only
//! child becomes the root and the tree loses a level.
//!
//! A delete that keeps its leaf at or above `min_keys` and frees no
//! overflow chain runs in place under the tree read lock instead, touching
//! only the leaf.
//!
//! Freed nodes are deleted with `DeleteFlags::RESTRUCTURE`. Merges keep the
//! leaf sibling chain intact: the surviving node inherits the outer link of
//! the freed one.

use eyre::Result;
use smallvec::SmallVec;

use super::context::{NodeRef, OpContext};
use super::interior::{self, InteriorNode, InteriorNodeMut};
use super::leaf::{self, KeyBuf, LeafNode, LeafNodeMut, SearchResult};
use super::metadata::{MetaFlags, Metadata};
use super::overflow;
use super::stats::Counters;
use super::tree::{find_leaf, persist_in_place, route};
use crate::config::PATH_INLINE_DEPTH;
use crate::error::BtreeError;
use crate::storage::{DeleteFlags, NodeHeader};

/// One interior node on a root-to-leaf path.
pub(crate) struct PathLevel {
    pub node: NodeRef,
    pub pos: usize,
    /// Separator bounding the child from below, `None` for the first child.
    pub lower: Option<KeyBuf>,
}

pub(crate) type Path = SmallVec<[PathLevel; PATH_INLINE_DEPTH]>;

/// Descends to the leaf covering `key`, recording every interior level.
pub(crate) fn descend(ctx: &mut OpContext<'_>, key: &[u8]) -> Result<(Path, NodeRef)> {
    let mut path = Path::new();
    let mut node = ctx.node(ctx.state.root)?;
    while !node.is_leaf()? {
        crate::ensure_node!(
            path.len() < ctx.state.height,
            "level uniformity",
            "descent passed recorded height {}",
            ctx.state.height
        );
        let (pos, child, _) = route(ctx, &node, key)?;
        let lower = if pos > 0 {
            let data = node.data.read();
            let view = InteriorNode::from_node(&data, ctx.layout().max_key_size)?;
            Some(KeyBuf::from_slice(view.key_at(pos - 1)?))
        } else {
            None
        };
        path.push(PathLevel {
            node,
            pos,
            lower,
        });
        node = ctx.node(child)?;
    }
    Ok((path, node))
}

pub(crate) fn delete_entry(ctx: &mut OpContext<'_>, key: &[u8], meta: &Metadata) -> Result<()> {
    let force = meta.flags.contains(MetaFlags::FORCE_DELETE);
    let (path, node) = descend(ctx, key)?;

    let (index, head) = {
        let data = node.data.read();
        let leaf = LeafNode::from_node(&data)?;
        let i = match leaf.find_key(key, ctx.tree().cmp())? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(_) => return Err(BtreeError::KeyNotFound.into()),
        };
        let e = leaf.entry_at(i)?;
        if e.tombstone && !force {
            return Err(BtreeError::KeyNotFound.into());
        }
        meta.check_old_seqno(e.seqno)?;
        (i, e.value.overflow_node())
    };

    let new_first = {
        let mut data = node.data.write();
        let mut leaf = LeafNodeMut::from_node(&mut data)?;
        leaf.remove_key_index(index)?;
        leaf.as_ref().first_key()?
    };
    ctx.mark_modified(&node);
    if let Some(head) = head {
        overflow::delete_chain(ctx, head)?;
    }

    if index == 0 && meta.flags.contains(MetaFlags::DELETE_INTERIOR_ENTRY) {
        if let Some(first) = new_first {
            refresh_separator(ctx, &path, key, &first)?;
        }
    }
    rebalance(ctx, path, node)
}

/// Removes `key` from its leaf under the tree read lock. Returns `false`,
/// with nothing changed, when the removal could leave the leaf below
/// `min_keys`, frees an overflow chain or must refresh a separator.
pub(crate) fn delete_in_place(ctx: &mut OpContext<'_>, key: &[u8], meta: &Metadata) -> Result<bool> {
    if meta.flags.contains(MetaFlags::DELETE_INTERIOR_ENTRY) {
        return Ok(false);
    }
    let node = find_leaf(ctx, key)?;
    let is_root = node.id == ctx.state.root;
    let min_keys = ctx.layout().min_keys;
    let force = meta.flags.contains(MetaFlags::FORCE_DELETE);

    let mut data = node.data.write();
    let (index, before) = {
        let leaf = LeafNode::from_node(&data)?;
        let i = match leaf.find_key(key, ctx.tree().cmp())? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(_) => return Err(BtreeError::KeyNotFound.into()),
        };
        let e = leaf.entry_at(i)?;
        if e.tombstone && !force {
            return Err(BtreeError::KeyNotFound.into());
        }
        meta.check_old_seqno(e.seqno)?;
        if e.value.overflow_node().is_some() || (!is_root && leaf.nkeys() <= min_keys) {
            return Ok(false);
        }
        (i, data.to_vec())
    };
    if let Err(e) = LeafNodeMut::from_node(&mut data).and_then(|mut leaf| leaf.remove_key_index(index)) {
        data.copy_from_slice(&before);
        return Err(e);
    }
    persist_in_place(ctx, &node, &mut data, &before)?;
    Ok(true)
}

/// Rewrites the ancestor separator equal to `removed` as `first`.
fn refresh_separator(ctx: &mut OpContext<'_>, path: &Path, removed: &[u8], first: &[u8]) -> Result<()> {
    let cmp = ctx.tree().cmp();
    let max_key = ctx.layout().max_key_size;
    for level in path.iter().rev() {
        let Some(lower) = &level.lower else {
            continue;
        };
        if cmp.compare(lower, removed).is_eq() {
            {
                let mut data = level.node.data.write();
                InteriorNodeMut::from_node(&mut data, max_key)?.set_key(level.pos - 1, first)?;
            }
            ctx.mark_modified(&level.node);
            return Ok(());
        }
    }
    Ok(())
}

/// Restores `min_keys` on the path bottom-up, starting at `node`.
fn rebalance(ctx: &mut OpContext<'_>, mut path: Path, mut node: NodeRef) -> Result<()> {
    let min_keys = ctx.layout().min_keys;
    while let Some(level) = path.pop() {
        if node.nkeys()? >= min_keys {
            break;
        }
        let parent = level.node;
        let pos = level.pos;
        let (parent_keys, left_id, right_id) = {
            let data = parent.data.read();
            let view = InteriorNode::from_node(&data, ctx.layout().max_key_size)?;
            let n = view.nkeys();
            let left = if pos > 0 { Some(view.child_at(pos - 1)?) } else { None };
            let right = if pos < n { Some(view.child_at(pos + 1)?) } else { None };
            (n, left, right)
        };
        if parent_keys == 0 {
            break;
        }

        if let Some(left_id) = left_id {
            let left = ctx.node(left_id)?;
            if left.nkeys()? > min_keys {
                borrow_from_left(ctx, &parent, pos, &left, &node)?;
                break;
            }
        }
        if let Some(right_id) = right_id {
            let right = ctx.node(right_id)?;
            if right.nkeys()? > min_keys {
                borrow_from_right(ctx, &parent, pos, &node, &right)?;
                break;
            }
        }

        match (left_id, right_id) {
            (Some(left_id), _) => {
                let left = ctx.node(left_id)?;
                merge_into_left(ctx, &parent, pos, &left, &node)?;
            }
            (None, Some(right_id)) => {
                let right = ctx.node(right_id)?;
                merge_first_child(ctx, &parent, &node, &right)?;
            }
            (None, None) => break,
        }
        node = parent;
    }
    collapse_root(ctx)
}

/// Entries (leaf) or children (interior) to move so both nodes end up even.
fn shift_count(surplus_side: usize, deficient: usize, min_keys: usize) -> usize {
    ((surplus_side - deficient) / 2).clamp(1, surplus_side - min_keys)
}

fn borrow_from_left(
    ctx: &mut OpContext<'_>,
    parent: &NodeRef,
    pos: usize,
    left: &NodeRef,
    node: &NodeRef,
) -> Result<()> {
    let max_key = ctx.layout().max_key_size;
    let want = shift_count(left.nkeys()?, node.nkeys()?, ctx.layout().min_keys);
    let is_leaf = node.is_leaf()?;
    let boundary = {
        let mut left_data = left.data.write();
        let mut node_data = node.data.write();
        if is_leaf {
            let mut from = LeafNodeMut::from_node(&mut left_data)?;
            let mut to = LeafNodeMut::from_node(&mut node_data)?;
            leaf::shift_right(&mut from, &mut to, want)?;
            first_key(&to)?
        } else {
            let sep = separator(parent, pos - 1, max_key)?;
            let mut from = InteriorNodeMut::from_node(&mut left_data, max_key)?;
            let mut to = InteriorNodeMut::from_node(&mut node_data, max_key)?;
            interior::shift_right(&mut from, &mut to, &sep, want)?
        }
    };
    set_separator(parent, pos - 1, &boundary, max_key)?;
    finish_shift(ctx, parent, left, node)
}

fn borrow_from_right(
    ctx: &mut OpContext<'_>,
    parent: &NodeRef,
    pos: usize,
    node: &NodeRef,
    right: &NodeRef,
) -> Result<()> {
    let max_key = ctx.layout().max_key_size;
    let want = shift_count(right.nkeys()?, node.nkeys()?, ctx.layout().min_keys);
    let is_leaf = node.is_leaf()?;
    let boundary = {
        let mut node_data = node.data.write();
        let mut right_data = right.data.write();
        if is_leaf {
            let mut from = LeafNodeMut::from_node(&mut right_data)?;
            let mut to = LeafNodeMut::from_node(&mut node_data)?;
            leaf::shift_left(&mut from, &mut to, want)?;
            first_key(&from)?
        } else {
            let sep = separator(parent, pos, max_key)?;
            let mut from = InteriorNodeMut::from_node(&mut right_data, max_key)?;
            let mut to = InteriorNodeMut::from_node(&mut node_data, max_key)?;
            interior::shift_left(&mut from, &mut to, &sep, want)?
        }
    };
    set_separator(parent, pos, &boundary, max_key)?;
    finish_shift(ctx, parent, node, right)
}

fn finish_shift(ctx: &mut OpContext<'_>, parent: &NodeRef, a: &NodeRef, b: &NodeRef) -> Result<()> {
    ctx.mark_modified(parent);
    ctx.mark_modified(a);
    ctx.mark_modified(b);
    Counters::bump(&ctx.tree().counters.shifts);
    tracing::debug!(from = a.id, to = b.id, "shifted entries between siblings");
    Ok(())
}

/// Folds `node` (child `pos > 0`) into its left sibling and frees it.
fn merge_into_left(
    ctx: &mut OpContext<'_>,
    parent: &NodeRef,
    pos: usize,
    left: &NodeRef,
    node: &NodeRef,
) -> Result<()> {
    let max_key = ctx.layout().max_key_size;
    let is_leaf = node.is_leaf()?;
    let next = {
        let mut left_data = left.data.write();
        let mut node_data = node.data.write();
        if is_leaf {
            let mut from = LeafNodeMut::from_node(&mut node_data)?;
            let mut to = LeafNodeMut::from_node(&mut left_data)?;
            leaf::merge_left(&mut from, &mut to)?;
            let next = from.header_mut()?.next();
            to.header_mut()?.set_next(next);
            next
        } else {
            let sep = separator(parent, pos - 1, max_key)?;
            let mut l = InteriorNodeMut::from_node(&mut left_data, max_key)?;
            let mut r = InteriorNodeMut::from_node(&mut node_data, max_key)?;
            interior::merge(&mut l, &mut r, &sep)?;
            0
        }
    };
    if next != 0 {
        let next_node = ctx.node(next)?;
        NodeHeader::from_bytes_mut(&mut next_node.data.write())?.set_prev(left.id);
        ctx.mark_modified(&next_node);
    }
    {
        let mut data = parent.data.write();
        InteriorNodeMut::from_node(&mut data, max_key)?.remove_separator_and_right_child(pos - 1)?;
    }
    finish_merge(ctx, parent, left, node)
}

/// Merges the first child of `parent` with its right sibling.
fn merge_first_child(ctx: &mut OpContext<'_>, parent: &NodeRef, node: &NodeRef, right: &NodeRef) -> Result<()> {
    let max_key = ctx.layout().max_key_size;
    let is_leaf = node.is_leaf()?;
    if is_leaf {
        let prev = {
            let mut node_data = node.data.write();
            let mut right_data = right.data.write();
            let mut from = LeafNodeMut::from_node(&mut node_data)?;
            let mut to = LeafNodeMut::from_node(&mut right_data)?;
            leaf::merge_right(&mut from, &mut to)?;
            let prev = from.header_mut()?.prev();
            to.header_mut()?.set_prev(prev);
            prev
        };
        if prev != 0 {
            let prev_node = ctx.node(prev)?;
            NodeHeader::from_bytes_mut(&mut prev_node.data.write())?.set_next(right.id);
            ctx.mark_modified(&prev_node);
        }
        {
            let mut data = parent.data.write();
            InteriorNodeMut::from_node(&mut data, max_key)?.remove_separator_and_left_child(0)?;
        }
        finish_merge(ctx, parent, right, node)
    } else {
        {
            let sep = separator(parent, 0, max_key)?;
            let mut node_data = node.data.write();
            let mut right_data = right.data.write();
            let mut l = InteriorNodeMut::from_node(&mut node_data, max_key)?;
            let mut r = InteriorNodeMut::from_node(&mut right_data, max_key)?;
            interior::merge(&mut l, &mut r, &sep)?;
        }
        {
            let mut data = parent.data.write();
            InteriorNodeMut::from_node(&mut data, max_key)?.remove_separator_and_right_child(0)?;
        }
        finish_merge(ctx, parent, node, right)
    }
}

fn finish_merge(ctx: &mut OpContext<'_>, parent: &NodeRef, survivor: &NodeRef, freed: &NodeRef) -> Result<()> {
    ctx.mark_modified(parent);
    ctx.mark_modified(survivor);
    ctx.delete_node(freed, DeleteFlags::RESTRUCTURE);
    Counters::bump(&ctx.tree().counters.merges);
    tracing::debug!(node = survivor.id, freed = freed.id, "merged siblings");
    Ok(())
}

/// Replaces an interior root that has no separators with its only child.
fn collapse_root(ctx: &mut OpContext<'_>) -> Result<()> {
    loop {
        let root = ctx.node(ctx.state.root)?;
        if root.is_leaf()? || root.nkeys()? > 0 {
            return Ok(());
        }
        let child = {
            let data = root.data.read();
            InteriorNode::from_node(&data, ctx.layout().max_key_size)?.child_at(0)?
        };
        ctx.delete_node(&root, DeleteFlags::RESTRUCTURE);
        ctx.state.root = child;
        ctx.state.height -= 1;
        Counters::bump(&ctx.tree().counters.root_collapses);
        tracing::debug!(root = child, height = ctx.state.height, "collapsed root");
    }
}

fn separator(parent: &NodeRef, i: usize, max_key: usize) -> Result<KeyBuf> {
    let data = parent.data.read();
    Ok(KeyBuf::from_slice(InteriorNode::from_node(&data, max_key)?.key_at(i)?))
}

fn set_separator(parent: &NodeRef, i: usize, key: &[u8], max_key: usize) -> Result<()> {
    let mut data = parent.data.write();
    InteriorNodeMut::from_node(&mut data, max_key)?.set_key(i, key)
}

fn first_key(leaf: &LeafNodeMut<'_>) -> Result<KeyBuf> {
    leaf.as_ref().first_key()?.ok_or_else(|| {
        BtreeError::corruption("shift", "leaf left empty by a shift").into()
    })
}
