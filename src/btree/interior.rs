//! # Interior Nodes
//!
//! Interior nodes route searches: `nkeys` separators and `nkeys + 1` child
//! ids. Separators are stored in fixed-size records sized for the tree's
//! maximum key, so replacing a separator never changes the node's footprint
//! and rebalancing can always rewrite a parent in place.
//!
//! ## Record Layout
//!
//! ```text
//! +----------------------------------+ 0
//! | NodeHeader (52 bytes)            |  rightmost = child for keys >= s[n-1]
//! +----------------------------------+ 52
//! | record 0: key_len | child | key  |  child = keys < s[0]
//! | record 1: key_len | child | key  |  child = s[0] <= keys < s[1]
//! | ...                              |
//! +----------------------------------+ 52 + n * stride
//! | unused                           |
//! +----------------------------------+ node_size
//!
//! stride = 2 (key_len) + 8 (child) + max_key_size
//! ```
//!
//! ## Navigation
//!
//! For a search key K the child position is the first `i` with `K < s[i]`,
//! or `n` (the rightmost child) when K is at or past every separator.
//!
//! ## Restructuring
//!
//! Split, shift and merge flatten the involved nodes (and the parent
//! separator between them, when there is one) into one key/child sequence
//! and cut it again:
//!
//! ```text
//! left:  c0 s0 c1 s1 c2         parent sep: P        right: d0 t0 d1
//! flat:  c0 s0 c1 s1 c2  P  d0 t0 d1
//! cut after 3 keys:  [c0 s0 c1 s1 c2 P d0]  t0  [d1]
//!                         new left           new sep  new right
//! ```

use std::cmp::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::compare::KeyComparator;
use super::leaf::KeyBuf;
use crate::config::{INTERIOR_RECORD_FIXED, NODE_HEADER_SIZE};
use crate::ensure_node;
use crate::storage::{NodeHeader, NodeKind};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RecordHead {
    key_len: U16,
    child: U64,
}

const _: () = assert!(size_of::<RecordHead>() == INTERIOR_RECORD_FIXED);

impl RecordHead {
    crate::zerocopy_accessors! {
        key_len: u16,
        child: u64,
    }
}

pub fn record_stride(max_key_size: usize) -> usize {
    INTERIOR_RECORD_FIXED + max_key_size
}

/// Separators an interior node of `node_size` bytes can hold.
pub fn interior_capacity(node_size: usize, max_key_size: usize) -> usize {
    node_size.saturating_sub(NODE_HEADER_SIZE) / record_stride(max_key_size)
}

fn check_interior(data: &[u8]) -> Result<&NodeHeader> {
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.kind()? == NodeKind::Interior,
        "expected interior node, got {:?} (node {})",
        header.kind()?,
        header.logical_id()
    );
    Ok(header)
}

fn head_at(data: &[u8], stride: usize, i: usize) -> Result<&RecordHead> {
    let at = NODE_HEADER_SIZE + i * stride;
    ensure!(at + stride <= data.len(), "interior record {} beyond node end", i);
    RecordHead::ref_from_bytes(&data[at..at + INTERIOR_RECORD_FIXED])
        .map_err(|e| eyre::eyre!("failed to read interior record {}: {:?}", i, e))
}

fn key_of(data: &[u8], stride: usize, i: usize) -> Result<&[u8]> {
    let len = head_at(data, stride, i)?.key_len() as usize;
    let start = NODE_HEADER_SIZE + i * stride + INTERIOR_RECORD_FIXED;
    ensure_node!(
        len <= stride - INTERIOR_RECORD_FIXED,
        "separator length",
        "separator {} claims {} bytes",
        i,
        len
    );
    Ok(&data[start..start + len])
}

#[derive(Debug, Clone, Copy)]
pub struct InteriorNode<'a> {
    data: &'a [u8],
    stride: usize,
}

pub struct InteriorNodeMut<'a> {
    data: &'a mut [u8],
    stride: usize,
}

impl<'a> InteriorNode<'a> {
    pub fn from_node(data: &'a [u8], max_key_size: usize) -> Result<Self> {
        check_interior(data)?;
        Ok(Self {
            data,
            stride: record_stride(max_key_size),
        })
    }

    pub fn nkeys(&self) -> usize {
        NodeHeader::from_bytes(self.data)
            .map(|h| h.nkeys() as usize)
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        (self.data.len() - NODE_HEADER_SIZE) / self.stride
    }

    pub fn is_full(&self) -> bool {
        self.nkeys() >= self.capacity()
    }

    pub fn level(&self) -> u8 {
        NodeHeader::from_bytes(self.data)
            .map(|h| h.level())
            .unwrap_or(0)
    }

    pub fn key_at(&self, i: usize) -> Result<&'a [u8]> {
        ensure_node!(
            i < self.nkeys(),
            "separator index",
            "separator {} out of bounds (nkeys={})",
            i,
            self.nkeys()
        );
        key_of(self.data, self.stride, i)
    }

    /// Child at position `i`; position `nkeys` is the rightmost child.
    pub fn child_at(&self, i: usize) -> Result<u64> {
        let n = self.nkeys();
        ensure_node!(i <= n, "child index", "child {} out of bounds (nkeys={})", i, n);
        if i == n {
            Ok(NodeHeader::from_bytes(self.data)?.rightmost())
        } else {
            Ok(head_at(self.data, self.stride, i)?.child())
        }
    }

    /// Child position for `key`: the first separator greater than `key`.
    pub fn find_child(&self, key: &[u8], cmp: &dyn KeyComparator) -> Result<(usize, u64)> {
        let mut lo = 0;
        let mut hi = self.nkeys();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp.compare(key, self.key_at(mid)?) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok((lo, self.child_at(lo)?))
    }

    pub fn validate(&self, cmp: &dyn KeyComparator) -> Result<()> {
        let n = self.nkeys();
        ensure_node!(
            n <= self.capacity(),
            "interior capacity",
            "{} separators exceed capacity {}",
            n,
            self.capacity()
        );
        for i in 0..=n {
            ensure_node!(self.child_at(i)? != 0, "child pointer", "child {} is null", i);
        }
        for i in 1..n {
            ensure_node!(
                cmp.compare(self.key_at(i - 1)?, self.key_at(i)?) == Ordering::Less,
                "separator order",
                "separator {} is not greater than separator {}",
                i,
                i - 1
            );
        }
        Ok(())
    }

    fn flatten(&self) -> Result<Flat> {
        let n = self.nkeys();
        let mut flat = Flat::default();
        for i in 0..n {
            flat.keys.push(KeyBuf::from_slice(self.key_at(i)?));
            flat.children.push(self.child_at(i)?);
        }
        flat.children.push(self.child_at(n)?);
        Ok(flat)
    }
}

#[derive(Default)]
struct Flat {
    keys: Vec<KeyBuf>,
    children: SmallVec<[u64; 64]>,
}

impl<'a> InteriorNodeMut<'a> {
    pub fn from_node(data: &'a mut [u8], max_key_size: usize) -> Result<Self> {
        check_interior(data)?;
        Ok(Self {
            data,
            stride: record_stride(max_key_size),
        })
    }

    /// Formats `data` as an interior node with no separators and a single
    /// child.
    pub fn init(
        data: &'a mut [u8],
        logical_id: u64,
        level: u8,
        max_key_size: usize,
        rightmost: u64,
    ) -> Result<Self> {
        let header = NodeHeader::init(data, NodeKind::Interior, level, logical_id)?;
        header.set_rightmost(rightmost);
        Ok(Self {
            data,
            stride: record_stride(max_key_size),
        })
    }

    pub fn as_ref(&self) -> InteriorNode<'_> {
        InteriorNode {
            data: &*self.data,
            stride: self.stride,
        }
    }

    pub fn nkeys(&self) -> usize {
        self.as_ref().nkeys()
    }

    pub fn is_full(&self) -> bool {
        self.as_ref().is_full()
    }

    fn max_key(&self) -> usize {
        self.stride - INTERIOR_RECORD_FIXED
    }

    fn write_record(&mut self, i: usize, key: &[u8], child: u64) -> Result<()> {
        ensure!(
            key.len() <= self.max_key(),
            "separator of {} bytes exceeds max key size {}",
            key.len(),
            self.max_key()
        );
        let at = NODE_HEADER_SIZE + i * self.stride;
        ensure!(at + self.stride <= self.data.len(), "interior record {} beyond node end", i);
        let head = RecordHead::mut_from_bytes(&mut self.data[at..at + INTERIOR_RECORD_FIXED])
            .map_err(|e| eyre::eyre!("failed to write interior record {}: {:?}", i, e))?;
        head.set_key_len(key.len() as u16);
        head.set_child(child);
        let key_at = at + INTERIOR_RECORD_FIXED;
        self.data[key_at..key_at + key.len()].copy_from_slice(key);
        self.data[key_at + key.len()..at + self.stride].fill(0);
        Ok(())
    }

    fn set_nkeys(&mut self, n: usize) -> Result<()> {
        NodeHeader::from_bytes_mut(self.data)?.set_nkeys(n as u16);
        Ok(())
    }

    pub fn set_key(&mut self, i: usize, key: &[u8]) -> Result<()> {
        let child = self.as_ref().child_at(i)?;
        ensure_node!(i < self.nkeys(), "separator index", "separator {} out of bounds", i);
        self.write_record(i, key, child)
    }

    /// Points position `i` (or the rightmost child when `i == nkeys`) at `child`.
    pub fn set_child(&mut self, i: usize, child: u64) -> Result<()> {
        let n = self.nkeys();
        ensure_node!(i <= n, "child index", "child {} out of bounds (nkeys={})", i, n);
        if i == n {
            NodeHeader::from_bytes_mut(self.data)?.set_rightmost(child);
        } else {
            let key = KeyBuf::from_slice(self.as_ref().key_at(i)?);
            self.write_record(i, &key, child)?;
        }
        Ok(())
    }

    /// Records the split of the child at position `p` into `left` and
    /// `right` around `boundary`.
    pub fn insert_child_split(&mut self, p: usize, boundary: &[u8], left: u64, right: u64) -> Result<()> {
        let n = self.nkeys();
        ensure_node!(p <= n, "child index", "split child {} out of bounds (nkeys={})", p, n);
        ensure_node!(!self.is_full(), "interior capacity", "no room for separator");
        ensure!(
            boundary.len() <= self.max_key(),
            "separator of {} bytes exceeds max key size {}",
            boundary.len(),
            self.max_key()
        );

        let start = NODE_HEADER_SIZE + p * self.stride;
        let end = NODE_HEADER_SIZE + n * self.stride;
        self.data.copy_within(start..end, start + self.stride);
        self.write_record(p, boundary, left)?;
        self.set_nkeys(n + 1)?;
        self.set_child(p + 1, right)
    }

    /// Removes separator `k` and the child to its right.
    pub fn remove_separator_and_right_child(&mut self, k: usize) -> Result<()> {
        let keep = self.as_ref().child_at(k)?;
        self.set_child(k + 1, keep)?;
        self.remove_record(k)
    }

    /// Removes separator `k` and the child to its left.
    pub fn remove_separator_and_left_child(&mut self, k: usize) -> Result<()> {
        self.remove_record(k)
    }

    fn remove_record(&mut self, k: usize) -> Result<()> {
        let n = self.nkeys();
        ensure_node!(k < n, "separator index", "separator {} out of bounds (nkeys={})", k, n);
        let start = NODE_HEADER_SIZE + k * self.stride;
        let end = NODE_HEADER_SIZE + n * self.stride;
        self.data.copy_within(start + self.stride..end, start);
        self.data[end - self.stride..end].fill(0);
        self.set_nkeys(n - 1)
    }

    fn write_flat(&mut self, keys: &[KeyBuf], children: &[u64]) -> Result<()> {
        ensure_node!(
            children.len() == keys.len() + 1,
            "child count",
            "{} separators with {} children",
            keys.len(),
            children.len()
        );
        ensure_node!(
            keys.len() <= self.as_ref().capacity(),
            "interior capacity",
            "{} separators exceed capacity {}",
            keys.len(),
            self.as_ref().capacity()
        );
        let used = NODE_HEADER_SIZE;
        self.data[used..].fill(0);
        for (i, key) in keys.iter().enumerate() {
            self.write_record(i, key, children[i])?;
        }
        self.set_nkeys(keys.len())?;
        NodeHeader::from_bytes_mut(self.data)?.set_rightmost(children[keys.len()]);
        Ok(())
    }
}

/// Moves the upper half of `from` into the empty node `to` and returns the
/// separator promoted to the parent.
pub fn split(from: &mut InteriorNodeMut<'_>, to: &mut InteriorNodeMut<'_>) -> Result<KeyBuf> {
    let flat = from.as_ref().flatten()?;
    let n = flat.keys.len();
    ensure_node!(n >= 3, "split", "cannot split an interior node with {} keys", n);
    let mid = n / 2;

    let promoted = flat.keys[mid].clone();
    from.write_flat(&flat.keys[..mid], &flat.children[..=mid])?;
    to.write_flat(&flat.keys[mid + 1..], &flat.children[mid + 1..])?;
    Ok(promoted)
}

/// Re-cuts `left`, `sep`, `right` so that `left` keeps `left_keys`
/// separators. Returns the new parent separator.
fn redistribute(
    left: &mut InteriorNodeMut<'_>,
    right: &mut InteriorNodeMut<'_>,
    sep: &[u8],
    left_keys: usize,
) -> Result<KeyBuf> {
    let l = left.as_ref().flatten()?;
    let r = right.as_ref().flatten()?;
    let mut keys = l.keys;
    keys.push(KeyBuf::from_slice(sep));
    keys.extend(r.keys);
    let mut children = l.children;
    children.extend(r.children);

    ensure_node!(
        left_keys < keys.len(),
        "shift",
        "cannot keep {} of {} separators on the left",
        left_keys,
        keys.len()
    );
    let new_sep = keys[left_keys].clone();
    left.write_flat(&keys[..left_keys], &children[..=left_keys])?;
    right.write_flat(&keys[left_keys + 1..], &children[left_keys + 1..])?;
    Ok(new_sep)
}

/// Rotates `count` children from `from` into its left neighbor `to` through
/// the parent separator `sep`. Returns the new parent separator.
pub fn shift_left(
    from: &mut InteriorNodeMut<'_>,
    to: &mut InteriorNodeMut<'_>,
    sep: &[u8],
    count: usize,
) -> Result<KeyBuf> {
    ensure_node!(
        count > 0 && count <= from.nkeys(),
        "shift",
        "cannot move {} of {} children",
        count,
        from.nkeys() + 1
    );
    let left_keys = to.nkeys() + count;
    redistribute(to, from, sep, left_keys)
}

/// Rotates `count` children from `from` into its right neighbor `to`
/// through the parent separator `sep`. Returns the new parent separator.
pub fn shift_right(
    from: &mut InteriorNodeMut<'_>,
    to: &mut InteriorNodeMut<'_>,
    sep: &[u8],
    count: usize,
) -> Result<KeyBuf> {
    ensure_node!(
        count > 0 && count <= from.nkeys(),
        "shift",
        "cannot move {} of {} children",
        count,
        from.nkeys() + 1
    );
    let left_keys = from.nkeys() - count;
    redistribute(from, to, sep, left_keys)
}

/// Appends `sep` and every child of `right` to `left`, emptying `right`.
pub fn merge(left: &mut InteriorNodeMut<'_>, right: &mut InteriorNodeMut<'_>, sep: &[u8]) -> Result<()> {
    let l = left.as_ref().flatten()?;
    let r = right.as_ref().flatten()?;
    let mut keys = l.keys;
    keys.push(KeyBuf::from_slice(sep));
    keys.extend(r.keys);
    let mut children = l.children;
    children.extend(r.children);

    left.write_flat(&keys, &children)?;
    let rightmost = children[children.len() - 1];
    right.write_flat(&[], &[rightmost])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::compare::BytewiseComparator;

    const NODE: usize = 1024;
    const MAX_KEY: usize = 16;

    fn build(data: &mut [u8], id: u64, seps: &[&[u8]], first_child: u64) -> Result<()> {
        let mut node = InteriorNodeMut::init(data, id, 1, MAX_KEY, first_child)?;
        for (i, sep) in seps.iter().enumerate() {
            let p = node.nkeys();
            node.insert_child_split(p, sep, first_child + i as u64, first_child + i as u64 + 1)?;
        }
        Ok(())
    }

    fn keys(node: &InteriorNode<'_>) -> Vec<Vec<u8>> {
        (0..node.nkeys())
            .map(|i| node.key_at(i).unwrap().to_vec())
            .collect()
    }

    fn children(node: &InteriorNode<'_>) -> Vec<u64> {
        (0..=node.nkeys()).map(|i| node.child_at(i).unwrap()).collect()
    }

    #[test]
    fn capacity_follows_stride() {
        assert_eq!(record_stride(MAX_KEY), 26);
        assert_eq!(interior_capacity(NODE, MAX_KEY), (NODE - 52) / 26);
    }

    #[test]
    fn navigation_picks_first_greater_separator() -> Result<()> {
        let mut data = vec![0u8; NODE];
        build(&mut data, 9, &[b"d", b"m", b"t"], 100)?;
        let node = InteriorNode::from_node(&data, MAX_KEY)?;

        assert_eq!(children(&node), vec![100, 101, 102, 103]);
        assert_eq!(node.find_child(b"a", &BytewiseComparator)?, (0, 100));
        assert_eq!(node.find_child(b"d", &BytewiseComparator)?, (1, 101));
        assert_eq!(node.find_child(b"p", &BytewiseComparator)?, (2, 102));
        assert_eq!(node.find_child(b"zz", &BytewiseComparator)?, (3, 103));
        node.validate(&BytewiseComparator)?;
        Ok(())
    }

    #[test]
    fn split_in_the_middle_of_children() -> Result<()> {
        let mut data = vec![0u8; NODE];
        build(&mut data, 9, &[b"d", b"t"], 100)?;
        let mut node = InteriorNodeMut::from_node(&mut data, MAX_KEY)?;

        node.insert_child_split(1, b"m", 101, 200)?;

        let view = node.as_ref();
        assert_eq!(keys(&view), vec![b"d".to_vec(), b"m".to_vec(), b"t".to_vec()]);
        assert_eq!(children(&view), vec![100, 101, 200, 102]);
        Ok(())
    }

    #[test]
    fn remove_keeps_the_chosen_child() -> Result<()> {
        let mut data = vec![0u8; NODE];
        build(&mut data, 9, &[b"d", b"m", b"t"], 100)?;
        let mut node = InteriorNodeMut::from_node(&mut data, MAX_KEY)?;

        node.remove_separator_and_right_child(2)?;
        assert_eq!(children(&node.as_ref()), vec![100, 101, 102]);

        node.remove_separator_and_left_child(0)?;
        assert_eq!(keys(&node.as_ref()), vec![b"m".to_vec()]);
        assert_eq!(children(&node.as_ref()), vec![101, 102]);
        Ok(())
    }

    #[test]
    fn split_promotes_middle_separator() -> Result<()> {
        let mut left_buf = vec![0u8; NODE];
        let mut right_buf = vec![0u8; NODE];
        build(&mut left_buf, 1, &[b"b", b"d", b"f", b"h", b"j"], 10)?;
        let mut left = InteriorNodeMut::from_node(&mut left_buf, MAX_KEY)?;
        let mut right = InteriorNodeMut::init(&mut right_buf, 2, 1, MAX_KEY, 0)?;

        let promoted = split(&mut left, &mut right)?;

        assert_eq!(&promoted[..], b"f");
        assert_eq!(keys(&left.as_ref()), vec![b"b".to_vec(), b"d".to_vec()]);
        assert_eq!(children(&left.as_ref()), vec![10, 11, 12]);
        assert_eq!(keys(&right.as_ref()), vec![b"h".to_vec(), b"j".to_vec()]);
        assert_eq!(children(&right.as_ref()), vec![13, 14, 15]);
        Ok(())
    }

    #[test]
    fn shifts_rotate_through_parent() -> Result<()> {
        let mut left_buf = vec![0u8; NODE];
        let mut right_buf = vec![0u8; NODE];
        build(&mut left_buf, 1, &[b"b", b"d", b"f"], 10)?;
        build(&mut right_buf, 2, &[b"p"], 20)?;
        let mut left = InteriorNodeMut::from_node(&mut left_buf, MAX_KEY)?;
        let mut right = InteriorNodeMut::from_node(&mut right_buf, MAX_KEY)?;

        let sep = shift_right(&mut left, &mut right, b"k", 1)?;
        assert_eq!(&sep[..], b"f");
        assert_eq!(keys(&right.as_ref()), vec![b"k".to_vec(), b"p".to_vec()]);
        assert_eq!(children(&right.as_ref()), vec![13, 20, 21]);

        let sep = shift_left(&mut right, &mut left, &sep, 1)?;
        assert_eq!(&sep[..], b"k");
        assert_eq!(children(&left.as_ref()), vec![10, 11, 12, 13]);
        assert_eq!(keys(&right.as_ref()), vec![b"p".to_vec()]);
        Ok(())
    }

    #[test]
    fn merge_pulls_down_separator() -> Result<()> {
        let mut left_buf = vec![0u8; NODE];
        let mut right_buf = vec![0u8; NODE];
        build(&mut left_buf, 1, &[b"b"], 10)?;
        build(&mut right_buf, 2, &[b"p"], 20)?;
        let mut left = InteriorNodeMut::from_node(&mut left_buf, MAX_KEY)?;
        let mut right = InteriorNodeMut::from_node(&mut right_buf, MAX_KEY)?;

        merge(&mut left, &mut right, b"k")?;

        assert_eq!(
            keys(&left.as_ref()),
            vec![b"b".to_vec(), b"k".to_vec(), b"p".to_vec()]
        );
        assert_eq!(children(&left.as_ref()), vec![10, 11, 20, 21]);
        assert_eq!(right.nkeys(), 0);
        Ok(())
    }

    #[test]
    fn oversized_separator_is_rejected() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut node = InteriorNodeMut::init(&mut data, 1, 1, MAX_KEY, 5)?;
        assert!(node.insert_child_split(0, &[b'x'; MAX_KEY + 1], 5, 6).is_err());
        Ok(())
    }
}
