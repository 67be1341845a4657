//! # Range Query Engine
//!
//! A range query is a cursor over the leaf level. The cursor holds no pins
//! and no locks between calls: it remembers the query, its resolved bounds
//! and the last key it produced. Each [`Btree::range_next`] call takes the
//! tree read lock, descends from the root to the first qualifying position
//! past that key (exclusive) and walks leaves through their sibling links:
//!
//! ```text
//! ascending:   start ──> leaf ──next──> leaf ──next──> ... until end bound
//! descending:  start ──> leaf ──prev──> leaf ──prev──> ... until end bound
//! ```
//!
//! Only one leaf lock is held at a time. Tombstones and entries outside the
//! seqno filter are skipped but still advance the cursor, so a resumed call
//! never sees them again. Writers may run between calls; a resumed cursor
//! sees their effects past its position.
//!
//! ## Buffers
//!
//! With `BUFFER_PROVIDED`, an item whose key or value exceeds the declared
//! buffer sizes is returned with `Status::BufferTooSmall` and no value,
//! unless `ALLOC_IF_TOO_SMALL` is also set.
//!
//! ## Ranged Update
//!
//! [`Btree::range_update`] walks a range in bounded steps and rewrites each
//! entry the caller's function returns a new value for. Every rewrite is a
//! conditional update against the seqno seen by the scan, so entries that
//! changed in between are left alone. A returned [`RupdateMarker`] resumes
//! the walk after the last key processed.

use std::cmp::Ordering;

use eyre::Result;

use super::context::{NodeRef, OpContext};
use super::leaf::{LeafNode, SearchResult};
use super::metadata::{MetaFlags, Metadata, RangeBounds, RangeFlags, RangeMeta};
use super::stats::Counters;
use super::tree::{route, Btree, StoredValue};
use crate::error::{BtreeError, Status};

/// Position of a range query between `range_next` calls.
#[derive(Debug, Clone)]
pub struct RangeCursor {
    meta: RangeMeta,
    bounds: RangeBounds,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl RangeCursor {
    pub fn meta(&self) -> &RangeMeta {
        &self.meta
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeItem {
    pub key: Vec<u8>,
    /// `None` for `KEYS_ONLY` queries and for items that did not fit the
    /// declared buffers.
    pub value: Option<Vec<u8>>,
    pub seqno: u64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBatch {
    pub items: Vec<RangeItem>,
    /// `QueryDone` when the range had nothing left.
    pub status: Status,
}

/// Resume point of a [`Btree::range_update`] walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupdateMarker {
    last_key: Vec<u8>,
}

impl RupdateMarker {
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUpdate {
    pub updated: usize,
    /// Set when the step stopped at `max` entries and more may follow.
    pub marker: Option<RupdateMarker>,
}

enum Step {
    Entry(usize),
    Move(u64),
    End,
}

impl Btree {
    /// Validates `meta` and returns a cursor positioned before the range.
    pub fn range_start(&self, meta: RangeMeta) -> Result<RangeCursor> {
        let bounds = meta.resolve()?;
        let inner = self.inner();
        for key in [&meta.start, &meta.end].into_iter().flatten() {
            inner.check_key(key)?;
        }
        Ok(RangeCursor {
            meta,
            bounds,
            last_key: None,
            done: false,
        })
    }

    /// Returns up to `n` items past the cursor.
    pub fn range_next(&self, cursor: &mut RangeCursor, n: usize) -> Result<RangeBatch> {
        if n == 0 {
            return Err(BtreeError::InvalidQuery("batch of zero items").into());
        }
        if cursor.done {
            return Ok(RangeBatch {
                items: Vec::new(),
                status: Status::QueryDone,
            });
        }

        let items = self.read_op(|ctx| collect(ctx, cursor, n))?;
        Counters::add(&self.inner().counters.range_items, items.len() as u64);
        let status = if items.is_empty() {
            cursor.done = true;
            Status::QueryDone
        } else {
            Status::Success
        };
        Ok(RangeBatch { items, status })
    }

    /// Releases the cursor.
    pub fn range_end(&self, cursor: RangeCursor) {
        tracing::trace!(done = cursor.done, "range query ended");
    }

    /// Rewrites up to `max` entries of the range described by `meta`,
    /// starting after `marker` when one is given.
    pub fn range_update<F>(
        &self,
        meta: &RangeMeta,
        marker: Option<&RupdateMarker>,
        max: usize,
        mut updater: F,
    ) -> Result<RangeUpdate>
    where
        F: FnMut(&[u8], &[u8]) -> Option<Vec<u8>>,
    {
        let mut scan = meta.clone();
        scan.flags.remove(
            RangeFlags::KEYS_ONLY | RangeFlags::BUFFER_PROVIDED | RangeFlags::ALLOC_IF_TOO_SMALL,
        );
        let mut cursor = self.range_start(scan)?;
        if let Some(marker) = marker {
            cursor.last_key = Some(marker.last_key.clone());
        }

        let batch = self.range_next(&mut cursor, max)?;
        let mut updated = 0;
        for item in &batch.items {
            let Some(value) = &item.value else {
                continue;
            };
            let Some(new_value) = updater(&item.key, value) else {
                continue;
            };
            let guard = Metadata::with_flags(MetaFlags::OLD_SEQNO_MUST_MATCH).seqno(item.seqno);
            match self.update(&item.key, &new_value, &guard) {
                Ok(()) => updated += 1,
                Err(e) if matches!(Status::of(&e), Status::StaleSeqno | Status::KeyNotFound) => {
                    tracing::trace!(status = %Status::of(&e), "range update skipped a changed entry");
                }
                Err(e) => return Err(e),
            }
        }
        Counters::add(&self.inner().counters.range_updates, updated as u64);

        let marker = match (&cursor.last_key, cursor.done) {
            (Some(last_key), false) if batch.items.len() == max => Some(RupdateMarker {
                last_key: last_key.clone(),
            }),
            _ => None,
        };
        Ok(RangeUpdate { updated, marker })
    }
}

fn collect(ctx: &mut OpContext<'_>, cursor: &mut RangeCursor, n: usize) -> Result<Vec<RangeItem>> {
    let cmp = ctx.tree().cmp();
    let descending = cursor.bounds.descending;
    let (mut leaf, mut idx) = position(ctx, cursor)?;
    let mut items = Vec::new();

    while items.len() < n {
        let step = {
            let data = leaf.data.read();
            let view = LeafNode::from_node(&data)?;
            let header = view.header()?;
            match idx {
                Some(i) if i < view.nkeys() => Step::Entry(i),
                _ if descending => match header.prev() {
                    0 => Step::End,
                    prev => Step::Move(prev),
                },
                _ => match header.next() {
                    0 => Step::End,
                    next => Step::Move(next),
                },
            }
        };

        let i = match step {
            Step::End => {
                cursor.done = true;
                break;
            }
            Step::Move(id) => {
                leaf = ctx.node(id)?;
                idx = if descending {
                    leaf.nkeys()?.checked_sub(1)
                } else {
                    Some(0)
                };
                continue;
            }
            Step::Entry(i) => i,
        };

        let (key, tombstone, seqno, value) = {
            let data = leaf.data.read();
            let e = LeafNode::from_node(&data)?.entry_at(i)?;
            (e.key.to_vec(), e.tombstone, e.seqno, StoredValue::of(&e.value))
        };
        idx = if descending { i.checked_sub(1) } else { Some(i + 1) };

        if past_end(cmp, &cursor.meta, &cursor.bounds, &key) {
            cursor.done = true;
            break;
        }
        cursor.last_key = Some(key.clone());
        if tombstone || !cursor.meta.admits_seqno(seqno) {
            continue;
        }
        items.push(make_item(ctx, &cursor.meta, key, seqno, value)?);
    }
    Ok(items)
}

fn make_item(
    ctx: &mut OpContext<'_>,
    meta: &RangeMeta,
    key: Vec<u8>,
    seqno: u64,
    value: StoredValue,
) -> Result<RangeItem> {
    let flags = meta.flags;
    let keys_only = flags.contains(RangeFlags::KEYS_ONLY);
    let too_big = flags.contains(RangeFlags::BUFFER_PROVIDED)
        && !flags.contains(RangeFlags::ALLOC_IF_TOO_SMALL)
        && (key.len() > meta.key_buf_size || (!keys_only && value.len() > meta.value_buf_size));
    if too_big {
        return Ok(RangeItem {
            key,
            value: None,
            seqno,
            status: Status::BufferTooSmall,
        });
    }
    let value = if keys_only {
        None
    } else {
        Some(value.materialize(ctx)?)
    };
    Ok(RangeItem {
        key,
        value,
        seqno,
        status: Status::Success,
    })
}

/// Leaf and entry index of the first candidate, `None` index meaning "move
/// to the neighbor leaf first".
fn position(ctx: &mut OpContext<'_>, cursor: &RangeCursor) -> Result<(NodeRef, Option<usize>)> {
    let descending = cursor.bounds.descending;
    let (seek, inclusive) = match &cursor.last_key {
        Some(key) => (Some(key.as_slice()), false),
        None => (cursor.meta.start.as_deref(), cursor.bounds.start_inclusive),
    };

    let mut node = ctx.node(ctx.state.root)?;
    while !node.is_leaf()? {
        let child = match seek {
            Some(key) => route(ctx, &node, key)?.1,
            None => {
                let data = node.data.read();
                let view = super::interior::InteriorNode::from_node(&data, ctx.layout().max_key_size)?;
                let edge = if descending { view.nkeys() } else { 0 };
                view.child_at(edge)?
            }
        };
        node = ctx.node(child)?;
    }

    let idx = {
        let data = node.data.read();
        let view = LeafNode::from_node(&data)?;
        let n = view.nkeys();
        match (seek, descending) {
            (None, false) => Some(0),
            (None, true) => n.checked_sub(1),
            (Some(key), false) => match view.find_key(key, ctx.tree().cmp())? {
                SearchResult::Found(i) if inclusive => Some(i),
                SearchResult::Found(i) => Some(i + 1),
                SearchResult::NotFound(i) => Some(i),
            },
            (Some(key), true) => match view.find_key(key, ctx.tree().cmp())? {
                SearchResult::Found(i) if inclusive => Some(i),
                SearchResult::Found(i) | SearchResult::NotFound(i) => i.checked_sub(1),
            },
        }
    };
    Ok((node, idx))
}

fn past_end(
    cmp: &dyn super::compare::KeyComparator,
    meta: &RangeMeta,
    bounds: &RangeBounds,
    key: &[u8],
) -> bool {
    let Some(end) = &meta.end else {
        return false;
    };
    match (cmp.compare(key, end), bounds.descending) {
        (Ordering::Equal, _) => !bounds.end_inclusive,
        (Ordering::Greater, false) | (Ordering::Less, true) => true,
        _ => false,
    }
}
