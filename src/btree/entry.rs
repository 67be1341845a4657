//! # Leaf Entry Metadata
//!
//! Each leaf entry blob begins with a tag byte followed by one of four
//! metadata shapes:
//!
//! ```text
//! tag: bit 0-2 = type, bit 3 = OVERFLOW, bit 4 = TOMBSTONE
//!
//! type 1: | tag | seqno (8) |
//! type 2: | tag | keylen u8  | datalen u8  | prefix_len u8  | prefix_idx u8  | seqno (8) |
//! type 3: | tag | keylen u16 | datalen u16 | prefix_len u16 | prefix_idx u16 | seqno (8) |
//! type 4: | tag | keylen u32 | datalen u32 | prefix_len u32 | prefix_idx u32 | seqno (8) |
//! ```
//!
//! A type 1 entry repeats the lengths and prefix reference of the previous
//! entry; its index record points at the blob that carries them. The blob
//! continues with the key suffix (`keylen - prefix_len` bytes) and the
//! inline value (`datalen` bytes, or the 8-byte overflow node id).

use eyre::Result;

use crate::config::{OVERFLOW_PTR_SIZE, SEQNO_SIZE};
use crate::ensure_node;

pub const TAG_TYPE_MASK: u8 = 0x07;
pub const TAG_OVERFLOW: u8 = 0x08;
pub const TAG_TOMBSTONE: u8 = 0x10;
pub const TAG_FLAG_MASK: u8 = TAG_OVERFLOW | TAG_TOMBSTONE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    Repeat = 1,
    Narrow = 2,
    Medium = 3,
    Wide = 4,
}

impl MetaType {
    /// Narrowest explicit shape whose fields hold both lengths.
    pub fn for_lengths(keylen: usize, datalen: usize) -> Self {
        let widest = keylen.max(datalen);
        if widest <= u8::MAX as usize {
            MetaType::Narrow
        } else if widest <= u16::MAX as usize {
            MetaType::Medium
        } else {
            MetaType::Wide
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag & TAG_TYPE_MASK {
            1 => Ok(MetaType::Repeat),
            2 => Ok(MetaType::Narrow),
            3 => Ok(MetaType::Medium),
            4 => Ok(MetaType::Wide),
            other => Err(crate::error::BtreeError::corruption(
                "entry type",
                format!("unknown entry metadata type {}", other),
            )
            .into()),
        }
    }

    pub fn field_width(self) -> usize {
        match self {
            MetaType::Repeat => 0,
            MetaType::Narrow => 1,
            MetaType::Medium => 2,
            MetaType::Wide => 4,
        }
    }

    pub fn header_len(self) -> usize {
        1 + 4 * self.field_width() + SEQNO_SIZE
    }

    pub fn max_field(self) -> u64 {
        match self {
            MetaType::Repeat => 0,
            MetaType::Narrow => u8::MAX as u64,
            MetaType::Medium => u16::MAX as u64,
            MetaType::Wide => u32::MAX as u64,
        }
    }

    fn prefix_idx_offset(self) -> usize {
        1 + 3 * self.field_width()
    }
}

/// Length and prefix description of one entry, resolved through type 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMeta {
    pub keylen: u32,
    pub datalen: u32,
    pub prefix_len: u32,
    pub prefix_idx: u32,
    pub flags: u8,
}

impl EntryMeta {
    pub fn is_overflow(&self) -> bool {
        self.flags & TAG_OVERFLOW != 0
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags & TAG_TOMBSTONE != 0
    }

    pub fn is_prefixed(&self) -> bool {
        self.prefix_len > 0
    }

    pub fn suffix_len(&self) -> usize {
        (self.keylen - self.prefix_len) as usize
    }

    pub fn inline_len(&self) -> usize {
        if self.is_overflow() {
            OVERFLOW_PTR_SIZE
        } else {
            self.datalen as usize
        }
    }

    /// True when a type 1 entry following `self` can describe `next`.
    pub fn repeats(&self, next: &EntryMeta) -> bool {
        self == next
    }
}

/// Writes the tag and metadata of an entry. Returns the header length.
pub fn encode_header(kind: MetaType, meta: &EntryMeta, seqno: u64, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.push(kind as u8 | (meta.flags & TAG_FLAG_MASK));
    let fields = [meta.keylen, meta.datalen, meta.prefix_len, meta.prefix_idx];
    match kind {
        MetaType::Repeat => {}
        MetaType::Narrow => fields.iter().for_each(|&f| out.push(f as u8)),
        MetaType::Medium => fields
            .iter()
            .for_each(|&f| out.extend_from_slice(&(f as u16).to_le_bytes())),
        MetaType::Wide => fields
            .iter()
            .for_each(|&f| out.extend_from_slice(&f.to_le_bytes())),
    }
    out.extend_from_slice(&seqno.to_le_bytes());
    out.len() - start
}

/// Decoded header of a blob. `meta` is `None` for type 1 blobs.
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub kind: MetaType,
    pub flags: u8,
    pub meta: Option<EntryMeta>,
    pub seqno: u64,
}

fn read_field(buf: &[u8], at: usize, width: usize) -> u32 {
    match width {
        1 => buf[at] as u32,
        2 => u16::from_le_bytes([buf[at], buf[at + 1]]) as u32,
        _ => u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]),
    }
}

pub fn decode_header(blob: &[u8]) -> Result<RawHeader> {
    ensure_node!(!blob.is_empty(), "entry bounds", "empty entry blob");
    let tag = blob[0];
    let kind = MetaType::from_tag(tag)?;
    let len = kind.header_len();
    ensure_node!(
        blob.len() >= len,
        "entry bounds",
        "entry header needs {} bytes, {} available",
        len,
        blob.len()
    );

    let w = kind.field_width();
    let meta = match kind {
        MetaType::Repeat => None,
        _ => Some(EntryMeta {
            keylen: read_field(blob, 1, w),
            datalen: read_field(blob, 1 + w, w),
            prefix_len: read_field(blob, 1 + 2 * w, w),
            prefix_idx: read_field(blob, 1 + 3 * w, w),
            flags: tag & TAG_FLAG_MASK,
        }),
    };
    let seq_at = 1 + 4 * w;
    let mut seq = [0u8; SEQNO_SIZE];
    seq.copy_from_slice(&blob[seq_at..seq_at + SEQNO_SIZE]);

    Ok(RawHeader {
        kind,
        flags: tag & TAG_FLAG_MASK,
        meta,
        seqno: u64::from_le_bytes(seq),
    })
}

/// Rewrites the stored prefix index of an explicit-shape blob in place.
pub fn write_prefix_idx(blob: &mut [u8], kind: MetaType, idx: u32) {
    let at = kind.prefix_idx_offset();
    match kind {
        MetaType::Repeat => {}
        MetaType::Narrow => blob[at] = idx as u8,
        MetaType::Medium => blob[at..at + 2].copy_from_slice(&(idx as u16).to_le_bytes()),
        MetaType::Wide => blob[at..at + 4].copy_from_slice(&idx.to_le_bytes()),
    }
}
