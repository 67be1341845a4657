//! # Structural Checker
//!
//! `Btree::check` walks the whole tree under the read lock and verifies the
//! invariants every operation must preserve:
//!
//! - each node decodes and passes its own `validate` (ordering, capacity,
//!   prefix chain for leaves, separator order for interiors)
//! - every non-root node holds at least `min_keys` keys
//! - every key of a subtree lies in the `[lower, upper)` range its ancestors'
//!   separators give it
//! - levels decrease by one per step down and every leaf sits at level 0,
//!   `height - 1` steps below the root
//! - the leaf level is one doubly linked list, left to right
//! - every overflow chain holds exactly the length its entry records
//! - the node count in the tree state matches the reachable nodes
//!
//! The first violation is returned as a `Corruption` error naming the
//! invariant.

use std::cmp::Ordering;

use eyre::Result;
use hashbrown::HashSet;

use super::compare::KeyComparator;
use super::context::OpContext;
use super::interior::InteriorNode;
use super::leaf::{EntryValue, KeyBuf, LeafNode};
use super::overflow;
use super::tree::Btree;
use crate::ensure_node;
use crate::storage::NodeHeader;

/// Shape of a tree that passed [`Btree::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub height: usize,
    pub leaves: usize,
    pub interiors: usize,
    pub overflow_nodes: usize,
    /// Live entries, tombstones excluded.
    pub entries: usize,
    pub tombstones: usize,
}

struct Visit {
    id: u64,
    level: u8,
    lower: Option<KeyBuf>,
    upper: Option<KeyBuf>,
}

impl Btree {
    /// Verifies the structural invariants of the whole tree.
    pub fn check(&self) -> Result<CheckReport> {
        let report = self.read_op(walk)?;
        tracing::debug!(
            height = report.height,
            leaves = report.leaves,
            entries = report.entries,
            "tree check passed"
        );
        Ok(report)
    }
}

fn walk(ctx: &mut OpContext<'_>) -> Result<CheckReport> {
    let state = ctx.state;
    let cmp = ctx.tree().cmp();
    let min_keys = ctx.layout().min_keys;
    let max_key = ctx.layout().max_key_size;

    ensure_node!(state.height > 0, "tree height", "tree with root {} has height 0", state.root);
    let mut report = CheckReport {
        height: state.height,
        ..CheckReport::default()
    };
    let mut seen = HashSet::new();
    let mut leaves = Vec::new();

    // Depth first, children pushed right to left so leaves come out in key order.
    let mut stack = vec![Visit {
        id: state.root,
        level: (state.height - 1) as u8,
        lower: None,
        upper: None,
    }];
    while let Some(visit) = stack.pop() {
        ensure_node!(seen.insert(visit.id), "single parent", "node {} is reachable twice", visit.id);
        let node = ctx.node(visit.id)?;
        ensure_node!(
            node.level()? == visit.level,
            "level uniformity",
            "node {} has level {}, expected {}",
            visit.id,
            node.level()?,
            visit.level
        );
        let is_root = visit.id == state.root;

        if visit.level == 0 {
            ensure_node!(node.is_leaf()?, "leaf level", "node {} at level 0 is not a leaf", visit.id);
            let mut chains = Vec::new();
            {
                let data = node.data.read();
                let view = LeafNode::from_node(&data)?;
                view.validate(cmp)?;
                let n = view.nkeys();
                ensure_node!(
                    is_root || n >= min_keys,
                    "minimum occupancy",
                    "leaf {} holds {} keys, minimum is {}",
                    visit.id,
                    n,
                    min_keys
                );
                for i in 0..n {
                    let entry = view.entry_at(i)?;
                    check_bounds(cmp, visit.id, &entry.key, &visit.lower, &visit.upper)?;
                    if entry.tombstone {
                        report.tombstones += 1;
                    } else {
                        report.entries += 1;
                    }
                    if let EntryValue::Overflow { node, len } = entry.value {
                        chains.push((node, len as usize));
                    }
                }
            }
            for (head, len) in chains {
                let ids = overflow::chain_ids(ctx, head)?;
                for id in &ids {
                    ensure_node!(seen.insert(*id), "single parent", "overflow node {} is shared", id);
                }
                overflow::read_chain(ctx, head, len)?;
                report.overflow_nodes += ids.len();
            }
            report.leaves += 1;
            leaves.push(node);
            continue;
        }

        let data = node.data.read();
        let view = InteriorNode::from_node(&data, max_key)?;
        view.validate(cmp)?;
        let n = view.nkeys();
        ensure_node!(
            n >= if is_root { 1 } else { min_keys },
            "minimum occupancy",
            "interior {} holds {} separators",
            visit.id,
            n
        );
        for i in 0..n {
            check_bounds(cmp, visit.id, view.key_at(i)?, &visit.lower, &visit.upper)?;
        }
        for i in (0..=n).rev() {
            let lower = match i {
                0 => visit.lower.clone(),
                _ => Some(KeyBuf::from_slice(view.key_at(i - 1)?)),
            };
            let upper = if i == n {
                visit.upper.clone()
            } else {
                Some(KeyBuf::from_slice(view.key_at(i)?))
            };
            stack.push(Visit {
                id: view.child_at(i)?,
                level: visit.level - 1,
                lower,
                upper,
            });
        }
        report.interiors += 1;
    }

    for (i, leaf) in leaves.iter().enumerate() {
        let data = leaf.data.read();
        let header = LeafNode::from_node(&data)?.header()?;
        let prev = i.checked_sub(1).map_or(0, |p| leaves[p].id);
        let next = leaves.get(i + 1).map_or(0, |l| l.id);
        ensure_node!(
            header.prev() == prev && header.next() == next,
            "sibling links",
            "leaf {} links {}<->{}, expected {}<->{}",
            leaf.id,
            header.prev(),
            header.next(),
            prev,
            next
        );
    }

    let reachable = report.leaves + report.interiors + report.overflow_nodes;
    ensure_node!(
        reachable as u64 == state.node_count,
        "node count",
        "{} nodes reachable, tree state records {}",
        reachable,
        state.node_count
    );
    Ok(report)
}

fn check_bounds(
    cmp: &dyn KeyComparator,
    node: u64,
    key: &[u8],
    lower: &Option<KeyBuf>,
    upper: &Option<KeyBuf>,
) -> Result<()> {
    if let Some(lower) = lower {
        ensure_node!(
            cmp.compare(key, lower) != Ordering::Less,
            "separator bounds",
            "key {:?} in node {} sorts below its lower separator",
            key,
            node
        );
    }
    if let Some(upper) = upper {
        ensure_node!(
            cmp.compare(key, upper) == Ordering::Less,
            "separator bounds",
            "key {:?} in node {} is not below its upper separator",
            key,
            node
        );
    }
    Ok(())
}

/// Ids of every node the tree references: tree nodes first, then the
/// overflow chains hanging off the leaves.
pub(crate) fn node_ids(ctx: &mut OpContext<'_>) -> Result<Vec<u64>> {
    let max_key = ctx.layout().max_key_size;
    let mut ids = Vec::new();
    let mut heads = Vec::new();
    let mut stack = vec![ctx.state.root];
    while let Some(id) = stack.pop() {
        ids.push(id);
        let node = ctx.node(id)?;
        let data = node.data.read();
        if NodeHeader::from_bytes(&data)?.is_leaf() {
            let view = LeafNode::from_node(&data)?;
            for i in 0..view.nkeys() {
                if let EntryValue::Overflow { node, .. } = view.entry_at(i)?.value {
                    heads.push(node);
                }
            }
        } else {
            let view = InteriorNode::from_node(&data, max_key)?;
            for i in 0..=view.nkeys() {
                stack.push(view.child_at(i)?);
            }
        }
    }
    for head in heads {
        ids.extend(overflow::chain_ids(ctx, head)?);
    }
    Ok(ids)
}
