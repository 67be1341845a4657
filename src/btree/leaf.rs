//! # Leaf Node Codec
//!
//! Leaf nodes store `(key, value, seqno)` entries in key order using a compact
//! variable-length layout with prefix compression.
//!
//! ## Node Layout
//!
//! ```text
//! +--------------------------+ 0
//! | NodeHeader (52 bytes)    |
//! +--------------------------+ 52
//! | index record 0           |  offset: u16, meta_off: u16
//! | index record 1           |  grows toward higher addresses
//! | ...                      |
//! +--------------------------+ 52 + nkeys * 4
//! | free space               |
//! +--------------------------+ insert_ptr
//! | blob nkeys-1             |  grows toward lower addresses
//! | ...                      |
//! | blob 1                   |
//! | blob 0                   |
//! +--------------------------+ node_size
//! ```
//!
//! Blobs are contiguous: blob `i` spans `[offset(i), offset(i - 1))`, with
//! `offset(-1) = node_size`. Every mutation keeps the payload compacted, so
//! the node never carries fragmented free space.
//!
//! ## Prefix Compression
//!
//! An entry may borrow the first `prefix_len` bytes of its key from entry
//! `prefix_idx`, which must be an earlier entry that is itself unprefixed:
//!
//! ```text
//! idx  key                  stored as
//! 0    "customer:0001:name"  unprefixed                    (anchor)
//! 1    "customer:0001:zip"   prefix 14 from 0 + "zip"
//! 2    "customer:0002:name"  prefix 12 from 0 + "2:name"
//! 3    "order:17"            unprefixed                    (new anchor)
//! ```
//!
//! The encoder always offers the current anchor, the last unprefixed entry
//! before the one being encoded, and uses it only when the shared prefix is
//! at least `MIN_COMMON_LENGTH` bytes and its index fits the entry's field
//! width.
//!
//! ## Impacted Runs
//!
//! An entry's encoding depends on its predecessor (type 1 repeats) and on
//! its anchor. Inserting, removing or replacing entry `i` therefore re-encodes
//! the run from `i` up to the first later entry that is self-contained
//! (unprefixed and not type 1). Entries past that point only move:
//!
//! ```text
//! before:  [0..i)  [i .. s)          [s .. n)
//!          untouched  decoded and      tail: blobs move by the size
//!                     re-encoded in    difference (adjust_offsets), prefix
//!                     a bump arena     indices shift by the count difference
//!                                      (adjust_prefix_idxes)
//! ```
//!
//! If shifting a tail prefix index would overflow its field width, the run
//! is extended past that entry so it is re-encoded instead.
//!
//! ## Dry Runs
//!
//! `is_full` plans the exact same splice without writing, so a full answer
//! is precise to the byte.
//!
//! ## Thread Safety
//!
//! `LeafNode` and `LeafNodeMut` borrow a node buffer; the owning `MemNode`
//! lock provides synchronization.

use std::cmp::Ordering;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::compare::KeyComparator;
use super::entry::{decode_header, encode_header, write_prefix_idx, EntryMeta, MetaType};
use super::entry::{TAG_OVERFLOW, TAG_TOMBSTONE};
use crate::config::{
    KEY_INLINE_CAPACITY, LEAF_INDEX_STRIDE, MIN_COMMON_LENGTH, NODE_HEADER_SIZE,
    OVERFLOW_PTR_SIZE,
};
use crate::ensure_node;
use crate::storage::{NodeHeader, NodeKind};

pub type KeyBuf = SmallVec<[u8; KEY_INLINE_CAPACITY]>;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexRecord {
    offset: U16,
    meta_off: U16,
}

const _: () = assert!(size_of::<IndexRecord>() == LEAF_INDEX_STRIDE);

impl IndexRecord {
    crate::zerocopy_accessors! {
        offset: u16,
        meta_off: u16,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryValue<'a> {
    Inline(&'a [u8]),
    Overflow { node: u64, len: u32 },
}

impl EntryValue<'_> {
    /// Logical value length.
    pub fn len(&self) -> usize {
        match self {
            EntryValue::Inline(v) => v.len(),
            EntryValue::Overflow { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the value occupies inside the leaf.
    pub fn inline_len(&self) -> usize {
        match self {
            EntryValue::Inline(v) => v.len(),
            EntryValue::Overflow { .. } => OVERFLOW_PTR_SIZE,
        }
    }

    pub fn overflow_node(&self) -> Option<u64> {
        match self {
            EntryValue::Overflow { node, .. } => Some(*node),
            EntryValue::Inline(_) => None,
        }
    }
}

/// Borrowed entry handed to the codec for writing.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: EntryValue<'a>,
    pub seqno: u64,
    pub tombstone: bool,
}

impl EntryRef<'_> {
    fn tag_flags(&self) -> u8 {
        let mut flags = 0;
        if matches!(self.value, EntryValue::Overflow { .. }) {
            flags |= TAG_OVERFLOW;
        }
        if self.tombstone {
            flags |= TAG_TOMBSTONE;
        }
        flags
    }
}

/// Decoded entry with its key materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry<'a> {
    pub key: KeyBuf,
    pub value: EntryValue<'a>,
    pub seqno: u64,
    pub tombstone: bool,
}

impl LeafEntry<'_> {
    pub fn entry_ref(&self) -> EntryRef<'_> {
        EntryRef {
            key: &self.key,
            value: self.value,
            seqno: self.seqno,
            tombstone: self.tombstone,
        }
    }
}

/// One entry as laid out in the node.
#[derive(Debug, Clone, Copy)]
struct RawEntry<'a> {
    kind: MetaType,
    meta: EntryMeta,
    seqno: u64,
    offset: usize,
    meta_off: usize,
    suffix: &'a [u8],
    inline: &'a [u8],
}

impl<'a> RawEntry<'a> {
    fn is_self_contained(&self) -> bool {
        self.kind != MetaType::Repeat && !self.meta.is_prefixed()
    }

    fn value(&self) -> Result<EntryValue<'a>> {
        if self.meta.is_overflow() {
            ensure_node!(
                self.inline.len() == OVERFLOW_PTR_SIZE,
                "overflow pointer",
                "overflow entry carries {} inline bytes",
                self.inline.len()
            );
            let mut id = [0u8; OVERFLOW_PTR_SIZE];
            id.copy_from_slice(self.inline);
            Ok(EntryValue::Overflow {
                node: u64::from_le_bytes(id),
                len: self.meta.datalen,
            })
        } else {
            Ok(EntryValue::Inline(self.inline))
        }
    }
}

fn header(data: &[u8]) -> Result<&NodeHeader> {
    NodeHeader::from_bytes(data)
}

fn nkeys(data: &[u8]) -> usize {
    header(data).map(|h| h.nkeys() as usize).unwrap_or(0)
}

fn insert_ptr(data: &[u8]) -> usize {
    header(data)
        .map(|h| h.insert_ptr() as usize)
        .unwrap_or(data.len())
}

fn index_end(n: usize) -> usize {
    NODE_HEADER_SIZE + n * LEAF_INDEX_STRIDE
}

fn record(data: &[u8], i: usize) -> Result<(usize, usize)> {
    let at = index_end(i);
    ensure!(
        at + LEAF_INDEX_STRIDE <= data.len(),
        "index record {} beyond node end",
        i
    );
    let rec = IndexRecord::ref_from_bytes(&data[at..at + LEAF_INDEX_STRIDE])
        .map_err(|e| eyre::eyre!("failed to read index record {}: {:?}", i, e))?;
    Ok((rec.offset() as usize, rec.meta_off() as usize))
}

fn write_record(data: &mut [u8], i: usize, offset: usize, meta_off: usize) -> Result<()> {
    let at = index_end(i);
    let rec = IndexRecord::mut_from_bytes(&mut data[at..at + LEAF_INDEX_STRIDE])
        .map_err(|e| eyre::eyre!("failed to write index record {}: {:?}", i, e))?;
    rec.set_offset(offset as u16);
    rec.set_meta_off(meta_off as u16);
    Ok(())
}

fn raw_entry(data: &[u8], i: usize) -> Result<RawEntry<'_>> {
    let n = nkeys(data);
    ensure_node!(i < n, "entry index", "entry {} out of bounds (nkeys={})", i, n);

    let (offset, meta_off) = record(data, i)?;
    let end = if i == 0 { data.len() } else { record(data, i - 1)?.0 };
    ensure_node!(
        insert_ptr(data) <= offset && offset < end && end <= data.len(),
        "entry bounds",
        "entry {} blob [{}, {}) outside payload",
        i,
        offset,
        end
    );

    let raw = decode_header(&data[offset..end])?;
    let meta = match raw.meta {
        Some(meta) => {
            ensure_node!(
                meta_off == offset,
                "entry metadata",
                "explicit entry {} points its metadata at {}",
                i,
                meta_off
            );
            meta
        }
        None => {
            ensure_node!(
                meta_off > offset && meta_off < data.len(),
                "entry metadata",
                "type 1 entry {} has metadata offset {}",
                i,
                meta_off
            );
            let source = decode_header(&data[meta_off..])?;
            let mut meta = source.meta.ok_or_else(|| {
                crate::error::BtreeError::corruption(
                    "entry metadata",
                    format!("type 1 entry {} points at another type 1 blob", i),
                )
            })?;
            meta.flags = raw.flags;
            meta
        }
    };

    ensure_node!(
        meta.prefix_len <= meta.keylen,
        "entry metadata",
        "entry {} prefix_len {} exceeds keylen {}",
        i,
        meta.prefix_len,
        meta.keylen
    );
    let suffix_start = offset + raw.kind.header_len();
    let suffix_end = suffix_start + meta.suffix_len();
    let inline_end = suffix_end + meta.inline_len();
    ensure_node!(
        inline_end == end,
        "entry bounds",
        "entry {} decodes to {} bytes but its blob spans {}",
        i,
        inline_end - offset,
        end - offset
    );

    Ok(RawEntry {
        kind: raw.kind,
        meta,
        seqno: raw.seqno,
        offset,
        meta_off,
        suffix: &data[suffix_start..suffix_end],
        inline: &data[suffix_end..inline_end],
    })
}

fn prefix_of<'a>(data: &'a [u8], raw: &RawEntry<'a>, i: usize) -> Result<&'a [u8]> {
    if !raw.meta.is_prefixed() {
        return Ok(&[]);
    }
    let p = raw.meta.prefix_idx as usize;
    ensure_node!(
        p < i,
        "prefix chain",
        "entry {} references later entry {}",
        i,
        p
    );
    let anchor = raw_entry(data, p)?;
    ensure_node!(
        !anchor.meta.is_prefixed(),
        "prefix chain",
        "entry {} references prefixed entry {}",
        i,
        p
    );
    let len = raw.meta.prefix_len as usize;
    ensure_node!(
        anchor.suffix.len() >= len,
        "prefix chain",
        "entry {} borrows {} bytes from a {} byte key",
        i,
        len,
        anchor.suffix.len()
    );
    Ok(&anchor.suffix[..len])
}

fn key_into<'a>(data: &'a [u8], i: usize, out: &mut KeyBuf) -> Result<RawEntry<'a>> {
    let raw = raw_entry(data, i)?;
    out.clear();
    out.extend_from_slice(prefix_of(data, &raw, i)?);
    out.extend_from_slice(raw.suffix);
    Ok(raw)
}

fn find_key(data: &[u8], key: &[u8], cmp: &dyn KeyComparator) -> Result<SearchResult> {
    let mut lo = 0;
    let mut hi = nkeys(data);
    let mut probe = KeyBuf::new();

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        key_into(data, mid, &mut probe)?;
        match cmp.compare(&probe, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(SearchResult::Found(mid)),
        }
    }

    Ok(SearchResult::NotFound(lo))
}

fn entry_at(data: &[u8], i: usize) -> Result<LeafEntry<'_>> {
    let mut key = KeyBuf::new();
    let raw = key_into(data, i, &mut key)?;
    Ok(LeafEntry {
        key,
        value: raw.value()?,
        seqno: raw.seqno,
        tombstone: raw.meta.is_tombstone(),
    })
}

fn free_space(data: &[u8]) -> usize {
    insert_ptr(data).saturating_sub(index_end(nkeys(data)))
}

fn check_leaf(data: &[u8]) -> Result<()> {
    let header = header(data)?;
    ensure!(
        header.kind()? == NodeKind::Leaf,
        "expected leaf node, got {:?} (node {})",
        header.kind()?,
        header.logical_id()
    );
    Ok(())
}

/// Copies every entry of a leaf into `bump`.
fn decode_all<'b>(data: &[u8], bump: &'b Bump) -> Result<BumpVec<'b, EntryRef<'b>>> {
    let n = nkeys(data);
    let mut out = BumpVec::with_capacity_in(n, bump);
    let mut key = KeyBuf::new();
    for i in 0..n {
        let raw = key_into(data, i, &mut key)?;
        out.push(copy_entry(bump, &key, &raw)?);
    }
    Ok(out)
}

fn copy_entry<'b>(bump: &'b Bump, key: &[u8], raw: &RawEntry<'_>) -> Result<EntryRef<'b>> {
    let value = match raw.value()? {
        EntryValue::Inline(v) => EntryValue::Inline(bump.alloc_slice_copy(v)),
        EntryValue::Overflow { node, len } => EntryValue::Overflow { node, len },
    };
    Ok(EntryRef {
        key: bump.alloc_slice_copy(key),
        value,
        seqno: raw.seqno,
        tombstone: raw.meta.is_tombstone(),
    })
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Where the metadata of an encoded entry lives once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaSrc {
    /// An untouched blob before the rewritten run, by absolute offset.
    Node(usize),
    /// A blob of the rewritten run, by position in the run.
    Run(usize),
}

struct Encoded<'b> {
    blob: &'b [u8],
    meta_src: MetaSrc,
}

struct Encoder<'k> {
    next_index: usize,
    prev: Option<(EntryMeta, MetaSrc)>,
    anchor: Option<(usize, &'k [u8])>,
    scratch: Vec<u8>,
}

impl<'k> Encoder<'k> {
    fn fresh() -> Self {
        Self {
            next_index: 0,
            prev: None,
            anchor: None,
            scratch: Vec::new(),
        }
    }

    /// Encoder state as it stood after entry `at - 1` of `data`.
    fn seeded(data: &'k [u8], at: usize) -> Result<Self> {
        let mut enc = Self::fresh();
        enc.next_index = at;
        if at == 0 {
            return Ok(enc);
        }
        let prev = raw_entry(data, at - 1)?;
        enc.anchor = if prev.meta.is_prefixed() {
            let p = prev.meta.prefix_idx as usize;
            Some((p, raw_entry(data, p)?.suffix))
        } else {
            Some((at - 1, prev.suffix))
        };
        enc.prev = Some((prev.meta, MetaSrc::Node(prev.meta_off)));
        Ok(enc)
    }

    fn encode<'b>(&mut self, e: &EntryRef<'k>, run_pos: usize, bump: &'b Bump) -> Result<Encoded<'b>> {
        let keylen = e.key.len();
        let datalen = e.value.len();
        ensure!(
            keylen <= u32::MAX as usize && datalen <= u32::MAX as usize,
            "entry lengths exceed u32"
        );
        let explicit = MetaType::for_lengths(keylen, datalen);

        let mut meta = EntryMeta {
            keylen: keylen as u32,
            datalen: datalen as u32,
            prefix_len: 0,
            prefix_idx: 0,
            flags: e.tag_flags(),
        };
        if let Some((idx, anchor_key)) = self.anchor {
            let common = common_prefix_len(anchor_key, e.key);
            if common >= MIN_COMMON_LENGTH && idx as u64 <= explicit.max_field() {
                meta.prefix_len = common as u32;
                meta.prefix_idx = idx as u32;
            }
        }

        let (kind, meta_src) = match self.prev {
            Some((prev, src)) if prev.repeats(&meta) => (MetaType::Repeat, src),
            _ => (explicit, MetaSrc::Run(run_pos)),
        };

        self.scratch.clear();
        encode_header(kind, &meta, e.seqno, &mut self.scratch);
        self.scratch
            .extend_from_slice(&e.key[meta.prefix_len as usize..]);
        match e.value {
            EntryValue::Inline(v) => self.scratch.extend_from_slice(v),
            EntryValue::Overflow { node, .. } => {
                self.scratch.extend_from_slice(&node.to_le_bytes())
            }
        }

        self.prev = Some((meta, meta_src));
        if !meta.is_prefixed() {
            self.anchor = Some((self.next_index, e.key));
        }
        self.next_index += 1;

        Ok(Encoded {
            blob: bump.alloc_slice_copy(&self.scratch),
            meta_src,
        })
    }
}

/// Bytes (payload plus index records) a fresh node needs for `entries`.
pub fn encoded_size(entries: &[EntryRef<'_>]) -> Result<usize> {
    let bump = Bump::new();
    let mut enc = Encoder::fresh();
    let mut total = 0;
    for (pos, e) in entries.iter().enumerate() {
        total += enc.encode(e, pos, &bump)?.blob.len() + LEAF_INDEX_STRIDE;
    }
    Ok(total)
}

/// Running totals of `encoded_size` over every prefix of `entries`.
fn cumulative_sizes(entries: &[EntryRef<'_>]) -> Result<Vec<usize>> {
    let bump = Bump::new();
    let mut enc = Encoder::fresh();
    let mut sizes = Vec::with_capacity(entries.len() + 1);
    let mut total = 0;
    sizes.push(0);
    for (pos, e) in entries.iter().enumerate() {
        total += enc.encode(e, pos, &bump)?.blob.len() + LEAF_INDEX_STRIDE;
        sizes.push(total);
    }
    Ok(sizes)
}

/// A rewrite of entries `[at, stop)` computed but not yet applied.
struct SplicePlan<'b> {
    at: usize,
    stop: usize,
    delta: isize,
    nkeys: usize,
    insert_ptr: usize,
    region_hi: usize,
    region_lo: usize,
    run: BumpVec<'b, Encoded<'b>>,
}

impl SplicePlan<'_> {
    fn new_len(&self) -> usize {
        self.run.iter().map(|e| e.blob.len()).sum()
    }

    fn diff(&self) -> isize {
        self.new_len() as isize - (self.region_hi - self.region_lo) as isize
    }

    fn new_nkeys(&self) -> usize {
        (self.nkeys as isize + self.delta) as usize
    }

    fn fits(&self) -> bool {
        let new_ip = self.insert_ptr as isize - self.diff();
        new_ip >= index_end(self.new_nkeys()) as isize && self.new_nkeys() <= u16::MAX as usize
    }

    fn bytes_delta(&self) -> isize {
        self.diff() + self.delta * LEAF_INDEX_STRIDE as isize
    }
}

/// First entry at or after `from` that can stay as is when the entries
/// before it are rewritten and the count changes by `delta`.
fn find_stop(data: &[u8], from: usize, n: usize, delta: isize) -> Result<usize> {
    let mut s = from;
    loop {
        while s < n && !raw_entry(data, s)?.is_self_contained() {
            s += 1;
        }
        if delta <= 0 {
            return Ok(s);
        }
        let mut widened = None;
        for t in s..n {
            let raw = raw_entry(data, t)?;
            if raw.kind != MetaType::Repeat
                && raw.meta.is_prefixed()
                && raw.meta.prefix_idx as u64 + delta as u64 > raw.kind.max_field()
            {
                widened = Some(t);
                break;
            }
        }
        match widened {
            Some(t) => s = t + 1,
            None => return Ok(s),
        }
    }
}

fn plan_splice<'b>(
    data: &[u8],
    bump: &'b Bump,
    at: usize,
    remove: usize,
    inserts: &[EntryRef<'_>],
) -> Result<SplicePlan<'b>> {
    let n = nkeys(data);
    ensure_node!(
        at + remove <= n,
        "entry index",
        "splice [{}, {}) beyond nkeys {}",
        at,
        at + remove,
        n
    );
    let delta = inserts.len() as isize - remove as isize;
    let stop = find_stop(data, at + remove, n, delta)?;

    let mut carried = BumpVec::with_capacity_in(stop - at - remove, bump);
    let mut key = KeyBuf::new();
    for j in at + remove..stop {
        let raw = key_into(data, j, &mut key)?;
        carried.push(copy_entry(bump, &key, &raw)?);
    }

    let mut enc = Encoder::seeded(data, at)?;
    let mut run = BumpVec::with_capacity_in(inserts.len() + carried.len(), bump);
    for e in inserts {
        let pos = run.len();
        run.push(enc.encode(e, pos, bump)?);
    }
    for e in carried.iter() {
        let pos = run.len();
        run.push(enc.encode(e, pos, bump)?);
    }

    let region_hi = if at == 0 {
        data.len()
    } else {
        record(data, at - 1)?.0
    };
    let region_lo = if stop > at {
        record(data, stop - 1)?.0
    } else {
        region_hi
    };

    Ok(SplicePlan {
        at,
        stop,
        delta,
        nkeys: n,
        insert_ptr: insert_ptr(data),
        region_hi,
        region_lo,
        run,
    })
}

fn apply_splice(data: &mut [u8], plan: &SplicePlan<'_>) -> Result<isize> {
    ensure_node!(
        plan.fits(),
        "node capacity",
        "splice at {} needs {} more bytes than free",
        plan.at,
        plan.bytes_delta() - free_space(data) as isize
    );
    let diff = plan.diff();
    let new_n = plan.new_nkeys();
    let new_ip = (plan.insert_ptr as isize - diff) as usize;

    // adjust_offsets: move tail blobs, then tail index records
    if diff != 0 && plan.region_lo > plan.insert_ptr {
        data.copy_within(plan.insert_ptr..plan.region_lo, new_ip);
    }
    let tail_new = (plan.stop as isize + plan.delta) as usize;
    if plan.delta != 0 && plan.stop < plan.nkeys {
        data.copy_within(index_end(plan.stop)..index_end(plan.nkeys), index_end(tail_new));
    }

    let mut positions: SmallVec<[usize; 16]> = SmallVec::with_capacity(plan.run.len());
    let mut pos = plan.region_hi;
    for e in plan.run.iter() {
        pos -= e.blob.len();
        data[pos..pos + e.blob.len()].copy_from_slice(e.blob);
        positions.push(pos);
    }
    for (k, e) in plan.run.iter().enumerate() {
        let meta_off = match e.meta_src {
            MetaSrc::Node(abs) => abs,
            MetaSrc::Run(r) => positions[r],
        };
        write_record(data, plan.at + k, positions[k], meta_off)?;
    }

    for t in tail_new..new_n {
        let (offset, meta_off) = record(data, t)?;
        let offset = (offset as isize - diff) as usize;
        let meta_off = (meta_off as isize - diff) as usize;
        write_record(data, t, offset, meta_off)?;

        // adjust_prefix_idxes
        if plan.delta != 0 {
            let raw = decode_header(&data[offset..])?;
            if let Some(meta) = raw.meta.filter(EntryMeta::is_prefixed) {
                let shifted = (meta.prefix_idx as isize + plan.delta) as u32;
                write_prefix_idx(&mut data[offset..], raw.kind, shifted);
            }
        }
    }

    let header = NodeHeader::from_bytes_mut(data)?;
    header.set_nkeys(new_n as u16);
    header.set_insert_ptr(new_ip as u16);
    Ok(plan.bytes_delta())
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafNode<'a> {
    pub fn from_node(data: &'a [u8]) -> Result<Self> {
        check_leaf(data)?;
        Ok(Self { data })
    }

    pub fn nkeys(&self) -> usize {
        nkeys(self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.nkeys() == 0
    }

    pub fn free_space(&self) -> usize {
        free_space(self.data)
    }

    /// Payload plus index bytes in use.
    pub fn used_bytes(&self) -> usize {
        self.data.len() - NODE_HEADER_SIZE - self.free_space()
    }

    pub fn header(&self) -> Result<&'a NodeHeader> {
        header(self.data)
    }

    pub fn key_at(&self, i: usize) -> Result<KeyBuf> {
        let mut key = KeyBuf::new();
        key_into(self.data, i, &mut key)?;
        Ok(key)
    }

    pub fn entry_at(&self, i: usize) -> Result<LeafEntry<'a>> {
        entry_at(self.data, i)
    }

    pub fn find_key(&self, key: &[u8], cmp: &dyn KeyComparator) -> Result<SearchResult> {
        find_key(self.data, key, cmp)
    }

    pub fn first_key(&self) -> Result<Option<KeyBuf>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.key_at(0).map(Some)
    }

    pub fn last_key(&self) -> Result<Option<KeyBuf>> {
        match self.nkeys() {
            0 => Ok(None),
            n => self.key_at(n - 1).map(Some),
        }
    }

    /// True when inserting `entry` at `i` would not fit.
    pub fn is_full(&self, entry: &EntryRef<'_>, i: usize) -> Result<bool> {
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, i, 0, std::slice::from_ref(entry))?;
        Ok(!plan.fits())
    }

    /// True when replacing entry `i` with `entry` would not fit.
    pub fn is_full_replace(&self, entry: &EntryRef<'_>, i: usize) -> Result<bool> {
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, i, 1, std::slice::from_ref(entry))?;
        Ok(!plan.fits())
    }

    /// Shape of entry `i`'s metadata, for diagnostics and tests.
    pub fn entry_shape(&self, i: usize) -> Result<(MetaType, EntryMeta)> {
        let raw = raw_entry(self.data, i)?;
        Ok((raw.kind, raw.meta))
    }

    /// Verifies layout, prefix references, type 1 chains and key order.
    pub fn validate(&self, cmp: &dyn KeyComparator) -> Result<()> {
        let n = self.nkeys();
        ensure_node!(
            index_end(n) <= insert_ptr(self.data),
            "index/payload overlap",
            "index ends at {} past insert_ptr {}",
            index_end(n),
            insert_ptr(self.data)
        );
        if n > 0 {
            let last = raw_entry(self.data, n - 1)?;
            ensure_node!(
                last.offset == insert_ptr(self.data),
                "payload compaction",
                "last blob at {} but insert_ptr {}",
                last.offset,
                insert_ptr(self.data)
            );
        }

        let mut prev_key = KeyBuf::new();
        let mut key = KeyBuf::new();
        let mut prev_meta: Option<EntryMeta> = None;
        for i in 0..n {
            let raw = key_into(self.data, i, &mut key)?;
            if raw.kind == MetaType::Repeat {
                ensure_node!(
                    prev_meta == Some(raw.meta),
                    "type 1 chain",
                    "entry {} repeats metadata that differs from entry {}",
                    i,
                    i.saturating_sub(1)
                );
            }
            if raw.meta.is_prefixed() {
                ensure_node!(
                    raw.meta.prefix_len as usize >= MIN_COMMON_LENGTH,
                    "prefix chain",
                    "entry {} uses a {} byte prefix",
                    i,
                    raw.meta.prefix_len
                );
            }
            if i > 0 {
                ensure_node!(
                    cmp.compare(&prev_key, &key) == Ordering::Less,
                    "key order",
                    "entry {} is not greater than entry {}",
                    i,
                    i - 1
                );
            }
            std::mem::swap(&mut prev_key, &mut key);
            prev_meta = Some(raw.meta);
        }
        Ok(())
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_node(data: &'a mut [u8]) -> Result<Self> {
        check_leaf(data)?;
        Ok(Self { data })
    }

    /// Formats `data` as an empty leaf owned by `logical_id`.
    pub fn init(data: &'a mut [u8], logical_id: u64) -> Result<Self> {
        NodeHeader::init(data, NodeKind::Leaf, 0, logical_id)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> LeafNode<'_> {
        LeafNode { data: &*self.data }
    }

    pub fn header_mut(&mut self) -> Result<&mut NodeHeader> {
        NodeHeader::from_bytes_mut(self.data)
    }

    pub fn nkeys(&self) -> usize {
        nkeys(self.data)
    }

    pub fn free_space(&self) -> usize {
        free_space(self.data)
    }

    pub fn insert_key_index(&mut self, entry: &EntryRef<'_>, i: usize) -> Result<isize> {
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, i, 0, std::slice::from_ref(entry))?;
        apply_splice(self.data, &plan)
    }

    pub fn remove_key_index(&mut self, i: usize) -> Result<isize> {
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, i, 1, &[])?;
        apply_splice(self.data, &plan)
    }

    pub fn replace_key_index(&mut self, entry: &EntryRef<'_>, i: usize) -> Result<isize> {
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, i, 1, std::slice::from_ref(entry))?;
        apply_splice(self.data, &plan)
    }

    /// True when inserting `entry` at `i` would not fit.
    pub fn is_full(&self, entry: &EntryRef<'_>, i: usize) -> Result<bool> {
        self.as_ref().is_full(entry, i)
    }

    /// True when replacing entry `i` with `entry` would not fit.
    pub fn is_full_replace(&self, entry: &EntryRef<'_>, i: usize) -> Result<bool> {
        self.as_ref().is_full_replace(entry, i)
    }

    /// Re-encodes the node to hold exactly `entries`, keeping header links.
    pub fn rebuild(&mut self, entries: &[EntryRef<'_>]) -> Result<()> {
        let node_size = self.data.len();
        {
            let header = self.header_mut()?;
            header.set_nkeys(0);
            header.set_insert_ptr(node_size as u16);
        }
        if entries.is_empty() {
            return Ok(());
        }
        let bump = Bump::new();
        let plan = plan_splice(self.data, &bump, 0, 0, entries)?;
        apply_splice(self.data, &plan)?;
        Ok(())
    }
}

fn capacity(data: &[u8]) -> usize {
    data.len() - NODE_HEADER_SIZE
}

/// Moves the upper part of `from` into the empty leaf `to` and returns the
/// boundary key: every key left in `from` < boundary <= every key in `to`.
pub fn split(from: &mut LeafNodeMut<'_>, to: &mut LeafNodeMut<'_>) -> Result<KeyBuf> {
    let bump = Bump::new();
    let entries = decode_all(from.data, &bump)?;
    let n = entries.len();
    ensure_node!(n >= 2, "split", "cannot split a leaf with {} entries", n);
    ensure_node!(to.nkeys() == 0, "split", "split target holds {} entries", to.nkeys());

    let cap = capacity(from.data);
    let left_sizes = cumulative_sizes(&entries)?;
    let mut mid = n / 2;
    while mid > 1 && left_sizes[mid] > cap {
        mid -= 1;
    }
    while mid < n - 1 && encoded_size(&entries[mid..])? > cap {
        mid += 1;
    }
    ensure_node!(
        left_sizes[mid] <= cap && encoded_size(&entries[mid..])? <= capacity(to.data),
        "split",
        "no split point fits {} entries",
        n
    );

    let boundary = KeyBuf::from_slice(entries[mid].key);
    from.rebuild(&entries[..mid])?;
    to.rebuild(&entries[mid..])?;
    Ok(boundary)
}

/// Moves up to `want` leading entries of `from` to the end of its left
/// neighbor `to`. Returns how many moved.
pub fn shift_left(from: &mut LeafNodeMut<'_>, to: &mut LeafNodeMut<'_>, want: usize) -> Result<usize> {
    let bump = Bump::new();
    let right = decode_all(from.data, &bump)?;
    let left = decode_all(to.data, &bump)?;

    for k in (1..=want.min(right.len())).rev() {
        let mut joined: Vec<EntryRef<'_>> = Vec::with_capacity(left.len() + k);
        joined.extend_from_slice(&left);
        joined.extend_from_slice(&right[..k]);
        if encoded_size(&joined)? <= capacity(to.data)
            && encoded_size(&right[k..])? <= capacity(from.data)
        {
            to.rebuild(&joined)?;
            from.rebuild(&right[k..])?;
            return Ok(k);
        }
    }
    Err(crate::error::BtreeError::corruption("shift", "no entry fits the left neighbor").into())
}

/// Moves up to `want` trailing entries of `from` to the front of its right
/// neighbor `to`. Returns how many moved.
pub fn shift_right(from: &mut LeafNodeMut<'_>, to: &mut LeafNodeMut<'_>, want: usize) -> Result<usize> {
    let bump = Bump::new();
    let left = decode_all(from.data, &bump)?;
    let right = decode_all(to.data, &bump)?;

    for k in (1..=want.min(left.len())).rev() {
        let split_at = left.len() - k;
        let mut joined: Vec<EntryRef<'_>> = Vec::with_capacity(right.len() + k);
        joined.extend_from_slice(&left[split_at..]);
        joined.extend_from_slice(&right);
        if encoded_size(&joined)? <= capacity(to.data)
            && encoded_size(&left[..split_at])? <= capacity(from.data)
        {
            to.rebuild(&joined)?;
            from.rebuild(&left[..split_at])?;
            return Ok(k);
        }
    }
    Err(crate::error::BtreeError::corruption("shift", "no entry fits the right neighbor").into())
}

/// Appends every entry of `from` to its left neighbor `to`, emptying `from`.
pub fn merge_left(from: &mut LeafNodeMut<'_>, to: &mut LeafNodeMut<'_>) -> Result<()> {
    let bump = Bump::new();
    let mut joined = decode_all(to.data, &bump)?;
    joined.extend(decode_all(from.data, &bump)?);
    ensure_node!(
        encoded_size(&joined)? <= capacity(to.data),
        "merge",
        "{} entries do not fit one leaf",
        joined.len()
    );
    to.rebuild(&joined)?;
    from.rebuild(&[])
}

/// Prepends every entry of `from` to its right neighbor `to`, emptying `from`.
pub fn merge_right(from: &mut LeafNodeMut<'_>, to: &mut LeafNodeMut<'_>) -> Result<()> {
    let bump = Bump::new();
    let mut joined = decode_all(from.data, &bump)?;
    joined.extend(decode_all(to.data, &bump)?);
    ensure_node!(
        encoded_size(&joined)? <= capacity(to.data),
        "merge",
        "{} entries do not fit one leaf",
        joined.len()
    );
    to.rebuild(&joined)?;
    from.rebuild(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::compare::BytewiseComparator;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    const NODE: usize = 8100;

    fn entry<'a>(key: &'a [u8], value: &'a [u8]) -> EntryRef<'a> {
        EntryRef {
            key,
            value: EntryValue::Inline(value),
            seqno: 1,
            tombstone: false,
        }
    }

    fn insert(leaf: &mut LeafNodeMut<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        match leaf.as_ref().find_key(key, &BytewiseComparator)? {
            SearchResult::NotFound(i) => {
                leaf.insert_key_index(&entry(key, value), i)?;
            }
            SearchResult::Found(i) => {
                leaf.replace_key_index(&entry(key, value), i)?;
            }
        }
        Ok(())
    }

    fn contents(leaf: &LeafNode<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (0..leaf.nkeys())
            .map(|i| {
                let e = leaf.entry_at(i)?;
                match e.value {
                    EntryValue::Inline(v) => Ok((e.key.to_vec(), v.to_vec())),
                    EntryValue::Overflow { .. } => eyre::bail!("unexpected overflow"),
                }
            })
            .collect()
    }

    #[test]
    fn insert_and_read_back() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 7)?;
        insert(&mut leaf, b"banana", b"yellow")?;
        insert(&mut leaf, b"apple", b"red")?;
        insert(&mut leaf, b"cherry", b"dark red")?;

        let view = leaf.as_ref();
        assert_eq!(view.nkeys(), 3);
        assert_eq!(&view.key_at(0)?[..], b"apple");
        assert_eq!(&view.key_at(2)?[..], b"cherry");
        assert_eq!(
            view.find_key(b"banana", &BytewiseComparator)?,
            SearchResult::Found(1)
        );
        assert_eq!(
            view.find_key(b"blueberry", &BytewiseComparator)?,
            SearchResult::NotFound(2)
        );
        view.validate(&BytewiseComparator)?;
        Ok(())
    }

    #[test]
    fn common_prefix_encodes_smaller() -> Result<()> {
        let prefix = b"tenant-0042/objects/";
        assert_eq!(prefix.len(), 20);
        let keys: Vec<Vec<u8>> = (0..20)
            .map(|i| {
                let mut k = prefix.to_vec();
                k.extend_from_slice(format!("{:03}", i).as_bytes());
                k
            })
            .collect();

        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        for k in &keys {
            insert(&mut leaf, k, b"v")?;
        }

        let unprefixed: usize = keys
            .iter()
            .map(|k| encoded_size(&[entry(k, b"v")]))
            .sum::<Result<usize>>()?;
        let view = leaf.as_ref();
        assert!(view.used_bytes() < unprefixed);

        let (_, first) = view.entry_shape(0)?;
        assert!(!first.is_prefixed());
        for i in 1..keys.len() {
            let (_, meta) = view.entry_shape(i)?;
            assert!(meta.prefix_len >= 20, "entry {} prefix {}", i, meta.prefix_len);
            assert_eq!(meta.prefix_idx, 0);
        }
        Ok(())
    }

    #[test]
    fn short_common_prefix_is_not_used() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        for k in [&b"abc1"[..], b"abc2", b"abc3", b"abd0"] {
            insert(&mut leaf, k, b"value")?;
        }

        let view = leaf.as_ref();
        for i in 0..view.nkeys() {
            assert!(!view.entry_shape(i)?.1.is_prefixed());
        }
        Ok(())
    }

    #[test]
    fn repeated_shapes_use_type_one() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        for k in [&b"k1"[..], b"k2", b"k3"] {
            insert(&mut leaf, k, b"vv")?;
        }

        let view = leaf.as_ref();
        assert_eq!(view.entry_shape(0)?.0, MetaType::Narrow);
        assert_eq!(view.entry_shape(1)?.0, MetaType::Repeat);
        assert_eq!(view.entry_shape(2)?.0, MetaType::Repeat);
        assert_eq!(&view.key_at(2)?[..], b"k3");
        Ok(())
    }

    #[test]
    fn removing_anchor_re_encodes_dependents() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        for i in 0..6 {
            insert(&mut leaf, format!("shared-prefix-{}", i).as_bytes(), b"x")?;
        }
        insert(&mut leaf, b"zzz-unrelated", b"y")?;

        leaf.remove_key_index(0)?;

        let view = leaf.as_ref();
        view.validate(&BytewiseComparator)?;
        assert_eq!(view.nkeys(), 6);
        assert_eq!(&view.key_at(0)?[..], b"shared-prefix-1");
        assert!(!view.entry_shape(0)?.1.is_prefixed());
        assert_eq!(&view.key_at(5)?[..], b"zzz-unrelated");
        Ok(())
    }

    #[test]
    fn insert_before_anchor_shifts_tail_prefix_indices() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        insert(&mut leaf, b"a", b"1")?;
        for i in 0..4 {
            insert(&mut leaf, format!("m-common-{}", i).as_bytes(), b"x")?;
        }
        assert_eq!(leaf.as_ref().entry_shape(2)?.1.prefix_idx, 1);

        insert(&mut leaf, b"b", b"2")?;

        let view = leaf.as_ref();
        view.validate(&BytewiseComparator)?;
        assert_eq!(view.entry_shape(3)?.1.prefix_idx, 2);
        assert_eq!(&view.key_at(5)?[..], b"m-common-3");
        Ok(())
    }

    #[test]
    fn prefix_index_that_outgrows_its_width_is_dropped() -> Result<()> {
        let mut data = vec![0u8; 32768];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        for i in 0..255 {
            insert(&mut leaf, format!("a{:03}", i).as_bytes(), b"v")?;
        }
        insert(&mut leaf, b"zzzzzzzz-000", b"v")?;
        insert(&mut leaf, b"zzzzzzzz-001", b"v")?;
        assert_eq!(leaf.as_ref().entry_shape(256)?.1.prefix_idx, 255);

        insert(&mut leaf, b"b", b"v")?;

        let view = leaf.as_ref();
        view.validate(&BytewiseComparator)?;
        assert_eq!(&view.key_at(258)?[..], b"zzzzzzzz-001");
        assert!(!view.entry_shape(258)?.1.is_prefixed());
        Ok(())
    }

    #[test]
    fn is_full_matches_actual_insert() -> Result<()> {
        let mut data = vec![0u8; 1024];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        let value = [0x33u8; 40];
        let mut i = 0u32;
        loop {
            let key = format!("key-{:05}", i);
            let e = entry(key.as_bytes(), &value);
            let at = leaf.nkeys();
            if leaf.is_full(&e, at)? {
                assert!(leaf.insert_key_index(&e, at).is_err());
                break;
            }
            leaf.insert_key_index(&e, at)?;
            i += 1;
        }
        assert!(i > 10);
        leaf.as_ref().validate(&BytewiseComparator)?;
        Ok(())
    }

    #[test]
    fn split_preserves_order_and_count() -> Result<()> {
        let mut left_buf = vec![0u8; NODE];
        let mut right_buf = vec![0u8; NODE];
        let mut left = LeafNodeMut::init(&mut left_buf, 1)?;
        let mut right = LeafNodeMut::init(&mut right_buf, 2)?;
        for i in 0..41 {
            insert(&mut left, format!("row:{:04}", i).as_bytes(), &[i as u8; 30])?;
        }

        let boundary = split(&mut left, &mut right)?;

        let l = left.as_ref();
        let r = right.as_ref();
        assert_eq!(l.nkeys() + r.nkeys(), 41);
        assert!(l.last_key()?.unwrap() < boundary);
        assert_eq!(r.first_key()?.unwrap(), boundary);
        l.validate(&BytewiseComparator)?;
        r.validate(&BytewiseComparator)?;
        Ok(())
    }

    #[test]
    fn shift_and_merge_move_entries() -> Result<()> {
        let mut a_buf = vec![0u8; NODE];
        let mut b_buf = vec![0u8; NODE];
        let mut a = LeafNodeMut::init(&mut a_buf, 1)?;
        let mut b = LeafNodeMut::init(&mut b_buf, 2)?;
        for i in 0..10 {
            insert(&mut a, format!("k{:02}", i).as_bytes(), b"a")?;
        }
        for i in 10..12 {
            insert(&mut b, format!("k{:02}", i).as_bytes(), b"b")?;
        }

        assert_eq!(shift_right(&mut a, &mut b, 3)?, 3);
        assert_eq!(a.nkeys(), 7);
        assert_eq!(&b.as_ref().key_at(0)?[..], b"k07");

        assert_eq!(shift_left(&mut b, &mut a, 1)?, 1);
        assert_eq!(&a.as_ref().key_at(7)?[..], b"k07");

        merge_left(&mut b, &mut a)?;
        assert_eq!(a.nkeys(), 12);
        assert_eq!(b.nkeys(), 0);
        a.as_ref().validate(&BytewiseComparator)?;

        merge_right(&mut a, &mut b)?;
        assert_eq!(b.nkeys(), 12);
        assert_eq!(&b.as_ref().key_at(11)?[..], b"k11");
        Ok(())
    }

    #[test]
    fn overflow_and_tombstone_flags_survive() -> Result<()> {
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;
        let big = EntryRef {
            key: b"big",
            value: EntryValue::Overflow { node: 99, len: 100_000 },
            seqno: 5,
            tombstone: false,
        };
        let dead = EntryRef {
            key: b"dead",
            value: EntryValue::Inline(b""),
            seqno: 6,
            tombstone: true,
        };
        leaf.insert_key_index(&big, 0)?;
        leaf.insert_key_index(&dead, 1)?;

        let view = leaf.as_ref();
        let e = view.entry_at(0)?;
        assert_eq!(e.value, EntryValue::Overflow { node: 99, len: 100_000 });
        assert_eq!(e.seqno, 5);
        assert!(view.entry_at(1)?.tombstone);
        assert_eq!(view.entry_shape(0)?.0, MetaType::Wide);
        Ok(())
    }

    #[test]
    fn random_operations_match_model() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut data = vec![0u8; NODE];
        let mut leaf = LeafNodeMut::init(&mut data, 1)?;

        for _ in 0..3000 {
            let group = rng.gen_range(0..4);
            let key = format!("group-{}-member-{:03}", group, rng.gen_range(0..60)).into_bytes();
            let remove = rng.gen_bool(0.35);
            let pos = leaf.as_ref().find_key(&key, &BytewiseComparator)?;
            match (remove, pos) {
                (true, SearchResult::Found(i)) => {
                    leaf.remove_key_index(i)?;
                    model.remove(&key);
                }
                (true, SearchResult::NotFound(_)) => {}
                (false, pos) => {
                    let value = vec![rng.gen::<u8>(); rng.gen_range(0..24)];
                    let e = entry(&key, &value);
                    let fits = match pos {
                        SearchResult::Found(i) => !leaf.is_full_replace(&e, i)?,
                        SearchResult::NotFound(i) => !leaf.is_full(&e, i)?,
                    };
                    if fits {
                        insert(&mut leaf, &key, &value)?;
                        model.insert(key, value);
                    }
                }
            }
        }

        let view = leaf.as_ref();
        view.validate(&BytewiseComparator)?;
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(contents(&view)?, expected);
        Ok(())
    }
}
